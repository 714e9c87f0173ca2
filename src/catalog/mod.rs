use crate::buffer_pool::{ArcBufferPool, PageGuard};
use crate::errors::DbError;
use crate::index::btree::BPlusTree;
use crate::pages::{PageId, CATALOG_PAGE_ID, PAGE_SIZE};
use crate::table::TableHeap;
use crate::tuple::schema::{Field, Schema};
use crate::txn::Transaction;
use crate::types::Types;
use crate::wal::log_manager::LogManager;
use anyhow::{bail, Context, Result};
use log::{debug, info};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub type TableOid = u32;
pub type IndexOid = u32;

/// The catalog page must keep this much slack; more metadata than that
/// refuses the DDL instead of chaining pages.
const CATALOG_PAGE_SLACK: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct TableMeta {
    pub oid: TableOid,
    pub name: String,
    pub schema: Schema,
    pub first_page_id: PageId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexMeta {
    pub oid: IndexOid,
    pub name: String,
    pub table_oid: TableOid,
    pub key_attrs: Vec<usize>,
    pub key_schema: Schema,
}

struct IndexEntry {
    meta: IndexMeta,
    index: Arc<BPlusTree>,
}

#[derive(Default)]
struct CatalogInner {
    table_names: HashMap<String, TableOid>,
    tables: HashMap<TableOid, TableMeta>,
    heaps: HashMap<TableOid, Arc<TableHeap>>,
    index_names: HashMap<String, IndexOid>,
    indexes: HashMap<IndexOid, IndexEntry>,
    next_table_oid: TableOid,
    next_index_oid: IndexOid,
}

/// Table and index metadata. Table entries and the oid counters persist
/// into page 0 in a fixed byte layout; index definitions are runtime
/// state that collaborators re-create after open. Reads take the reader
/// lock, every mutation takes the writer lock and re-persists the page.
pub struct Catalog {
    bpm: ArcBufferPool,
    log: Arc<LogManager>,
    inner: RwLock<CatalogInner>,
}

impl Catalog {
    /// Loads the catalog from page 0. A zeroed page (fresh database)
    /// reads as an empty catalog.
    pub fn load(bpm: ArcBufferPool, log: Arc<LogManager>) -> Result<Self> {
        let inner = {
            let guard = PageGuard::fetch(&bpm, CATALOG_PAGE_ID)?;
            let page = guard.read();
            parse_catalog_page(page.data())?
        };
        info!(
            "catalog loaded: {} tables, next oids ({}, {})",
            inner.tables.len(),
            inner.next_table_oid,
            inner.next_index_oid
        );
        Ok(Self {
            bpm,
            log,
            inner: RwLock::new(inner),
        })
    }

    pub fn create_table(
        &self,
        name: &str,
        schema: &Schema,
        _txn: Option<&Transaction>,
    ) -> Result<TableOid> {
        let mut inner = self.inner.write();
        if inner.table_names.contains_key(name) {
            bail!(DbError::Constraint(format!("table {name} already exists")));
        }

        let heap = Arc::new(TableHeap::create(self.bpm.clone(), self.log.clone())?);
        let oid = inner.next_table_oid;
        let meta = TableMeta {
            oid,
            name: name.to_string(),
            schema: schema.clone(),
            first_page_id: heap.first_page_id(),
        };

        inner.next_table_oid += 1;
        inner.table_names.insert(name.to_string(), oid);
        inner.tables.insert(oid, meta);
        inner.heaps.insert(oid, heap);

        if let Err(e) = self.persist(&inner) {
            // roll the maps back so memory matches the page
            inner.table_names.remove(name);
            inner.tables.remove(&oid);
            inner.heaps.remove(&oid);
            inner.next_table_oid = oid;
            return Err(e);
        }
        debug!("created table {name} with oid {oid}");
        Ok(oid)
    }

    /// Unregisters the table. Its pages leak: the pager has no free
    /// list.
    pub fn drop_table(&self, name: &str, _txn: Option<&Transaction>) -> Result<()> {
        let mut inner = self.inner.write();
        let oid = match inner.table_names.remove(name) {
            Some(oid) => oid,
            None => bail!(DbError::NotFound(format!("table {name}"))),
        };
        inner.tables.remove(&oid);
        inner.heaps.remove(&oid);

        let dropped: Vec<IndexOid> = inner
            .indexes
            .iter()
            .filter(|(_, e)| e.meta.table_oid == oid)
            .map(|(&index_oid, _)| index_oid)
            .collect();
        for index_oid in dropped {
            if let Some(entry) = inner.indexes.remove(&index_oid) {
                inner.index_names.remove(&entry.meta.name);
            }
        }

        self.persist(&inner)?;
        debug!("dropped table {name} (oid {oid})");
        Ok(())
    }

    pub fn table_oid(&self, name: &str) -> Option<TableOid> {
        self.inner.read().table_names.get(name).copied()
    }

    pub fn table_meta(&self, name: &str) -> Option<TableMeta> {
        let inner = self.inner.read();
        let oid = inner.table_names.get(name)?;
        inner.tables.get(oid).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().table_names.keys().cloned().collect();
        names.sort();
        names
    }

    /// The heap of a table, opened lazily after a restart.
    pub fn heap(&self, oid: TableOid) -> Result<Arc<TableHeap>> {
        if let Some(heap) = self.inner.read().heaps.get(&oid) {
            return Ok(heap.clone());
        }
        let mut inner = self.inner.write();
        if let Some(heap) = inner.heaps.get(&oid) {
            return Ok(heap.clone());
        }
        let first_page_id = match inner.tables.get(&oid) {
            Some(meta) => meta.first_page_id,
            None => bail!(DbError::NotFound(format!("table oid {oid}"))),
        };
        let heap = Arc::new(TableHeap::open(
            self.bpm.clone(),
            self.log.clone(),
            first_page_id,
        )?);
        inner.heaps.insert(oid, heap.clone());
        Ok(heap)
    }

    /// Registers a single-column B+ tree index. The caller backfills it
    /// from the table contents.
    pub fn create_index(
        &self,
        name: &str,
        table_name: &str,
        key_attrs: &[usize],
    ) -> Result<(IndexOid, Arc<BPlusTree>)> {
        let mut inner = self.inner.write();
        if inner.index_names.contains_key(name) {
            bail!(DbError::Constraint(format!("index {name} already exists")));
        }
        let table_oid = match inner.table_names.get(table_name) {
            Some(&oid) => oid,
            None => bail!(DbError::NotFound(format!("table {table_name}"))),
        };
        let schema = &inner.tables[&table_oid].schema;
        let key_schema = schema.project(key_attrs)?;
        if key_attrs.len() != 1 {
            bail!(DbError::Constraint(
                "indexes cover exactly one column".to_string()
            ));
        }
        let key_type = key_schema.fields[0].ty;
        if matches!(key_type, Types::Null | Types::Vector) {
            bail!(DbError::Constraint(format!(
                "{} columns cannot be indexed",
                key_type.name()
            )));
        }

        let index = Arc::new(BPlusTree::create(self.bpm.clone(), key_type)?);
        let oid = inner.next_index_oid;
        inner.next_index_oid += 1;
        inner.index_names.insert(name.to_string(), oid);
        inner.indexes.insert(
            oid,
            IndexEntry {
                meta: IndexMeta {
                    oid,
                    name: name.to_string(),
                    table_oid,
                    key_attrs: key_attrs.to_vec(),
                    key_schema,
                },
                index: index.clone(),
            },
        );
        self.persist(&inner)?;
        debug!(
            "created index {name} (oid {oid}) on {table_name}, root page {}",
            index.root_page_id()
        );
        Ok((oid, index))
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let oid = match inner.index_names.remove(name) {
            Some(oid) => oid,
            None => bail!(DbError::NotFound(format!("index {name}"))),
        };
        inner.indexes.remove(&oid);
        self.persist(&inner)?;
        Ok(())
    }

    pub fn index_meta(&self, name: &str) -> Option<IndexMeta> {
        let inner = self.inner.read();
        let oid = inner.index_names.get(name)?;
        inner.indexes.get(oid).map(|e| e.meta.clone())
    }

    /// Every index on a table, with its key projection.
    pub fn table_indexes(&self, table_oid: TableOid) -> Vec<(IndexMeta, Arc<BPlusTree>)> {
        self.inner
            .read()
            .indexes
            .values()
            .filter(|e| e.meta.table_oid == table_oid)
            .map(|e| (e.meta.clone(), e.index.clone()))
            .collect()
    }

    /// Serializes the catalog into page 0 and flushes it.
    fn persist(&self, inner: &CatalogInner) -> Result<()> {
        let image = build_catalog_page(inner)?;
        let mut guard = PageGuard::fetch(&self.bpm, CATALOG_PAGE_ID)?;
        guard.write().write_bytes(0, &image);
        drop(guard);
        self.bpm.lock().flush_page(CATALOG_PAGE_ID)?;
        Ok(())
    }
}

fn build_catalog_page(inner: &CatalogInner) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(PAGE_SIZE);
    let mut oids: Vec<TableOid> = inner.tables.keys().copied().collect();
    oids.sort_unstable();

    out.extend_from_slice(&(oids.len() as u32).to_le_bytes());
    for oid in oids {
        let meta = &inner.tables[&oid];
        out.extend_from_slice(&(meta.name.len() as u32).to_le_bytes());
        out.extend_from_slice(meta.name.as_bytes());
        out.extend_from_slice(&meta.oid.to_le_bytes());
        out.extend_from_slice(&meta.first_page_id.to_le_bytes());
        out.extend_from_slice(&(meta.schema.fields.len() as u32).to_le_bytes());
        for field in &meta.schema.fields {
            out.extend_from_slice(&(field.name.len() as u32).to_le_bytes());
            out.extend_from_slice(field.name.as_bytes());
            out.push(field.ty.tag());
            out.extend_from_slice(&field.length.to_le_bytes());
            out.push(field.nullable as u8);
        }
    }

    if out.len() > PAGE_SIZE - CATALOG_PAGE_SLACK {
        bail!(DbError::Exhausted("catalog page space".to_string()));
    }

    out.resize(PAGE_SIZE, 0);
    out[PAGE_SIZE - 16..PAGE_SIZE - 12]
        .copy_from_slice(&inner.next_table_oid.to_le_bytes());
    out[PAGE_SIZE - 8..PAGE_SIZE - 4].copy_from_slice(&inner.next_index_oid.to_le_bytes());
    Ok(out)
}

fn parse_catalog_page(data: &[u8; PAGE_SIZE]) -> Result<CatalogInner> {
    let mut inner = CatalogInner::default();
    let mut pos = 0usize;

    let n_tables = read_u32(data, &mut pos)?;
    for _ in 0..n_tables {
        let name = read_string(data, &mut pos)?;
        let oid = read_u32(data, &mut pos)?;
        let first_page_id = read_u32(data, &mut pos)?;
        let n_cols = read_u32(data, &mut pos)?;
        let mut fields = Vec::with_capacity(n_cols as usize);
        for _ in 0..n_cols {
            let col_name = read_string(data, &mut pos)?;
            let tag = data
                .get(pos)
                .copied()
                .context("catalog column tag past the page end")?;
            pos += 1;
            let ty = Types::from_tag(tag)?;
            let length = read_u32(data, &mut pos)?;
            let nullable = data
                .get(pos)
                .copied()
                .context("catalog nullable flag past the page end")?
                != 0;
            pos += 1;
            fields.push(Field {
                name: col_name,
                ty,
                length,
                nullable,
            });
        }
        inner.table_names.insert(name.clone(), oid);
        inner.tables.insert(
            oid,
            TableMeta {
                oid,
                name,
                schema: Schema::new(fields),
                first_page_id,
            },
        );
    }

    let mut tail = PAGE_SIZE - 16;
    inner.next_table_oid = read_u32(data, &mut tail)?.max(1);
    let mut tail = PAGE_SIZE - 8;
    inner.next_index_oid = read_u32(data, &mut tail)?.max(1);
    Ok(inner)
}

fn read_u32(data: &[u8; PAGE_SIZE], pos: &mut usize) -> Result<u32> {
    if *pos + 4 > PAGE_SIZE {
        bail!(DbError::Corruption("catalog entry past the page end".into()));
    }
    let v = u32::from_le_bytes(data[*pos..*pos + 4].try_into()?);
    *pos += 4;
    Ok(v)
}

fn read_string(data: &[u8; PAGE_SIZE], pos: &mut usize) -> Result<String> {
    let len = read_u32(data, pos)? as usize;
    if *pos + len > PAGE_SIZE {
        bail!(DbError::Corruption("catalog name past the page end".into()));
    }
    let s = String::from_utf8(data[*pos..*pos + len].to_vec())
        .map_err(|_| DbError::Corruption("catalog name is not valid utf-8".into()))?;
    *pos += len;
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::tests::test_bpm_with_log;
    use anyhow::Result;

    fn people() -> Schema {
        Schema::new(vec![
            Field::new("id", Types::Int32, false),
            Field::new("name", Types::Str, true).with_length(64),
        ])
    }

    fn test_catalog() -> Catalog {
        let (bpm, log) = test_bpm_with_log(16);
        Catalog::load(bpm, log).unwrap()
    }

    #[test]
    fn test_create_and_lookup() -> Result<()> {
        let catalog = test_catalog();
        let oid = catalog.create_table("people", &people(), None)?;
        let meta = catalog.table_meta("people").unwrap();
        assert_eq!(meta.oid, oid);
        assert_eq!(meta.schema, people());
        assert_ne!(meta.first_page_id, CATALOG_PAGE_ID);
        assert!(catalog.table_meta("ghosts").is_none());
        Ok(())
    }

    #[test]
    fn test_duplicate_table_refused() -> Result<()> {
        let catalog = test_catalog();
        catalog.create_table("t", &people(), None)?;
        let err = catalog.create_table("t", &people(), None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::Constraint(_))
        ));
        Ok(())
    }

    #[test]
    fn test_page_round_trip() -> Result<()> {
        let catalog = test_catalog();
        catalog.create_table("a", &people(), None)?;
        catalog.create_table("b", &people(), None)?;
        catalog.drop_table("a", None)?;

        // re-parse what persist wrote
        let image = build_catalog_page(&catalog.inner.read())?;
        let parsed = parse_catalog_page(image.as_slice().try_into()?)?;
        assert_eq!(parsed.tables.len(), 1);
        let meta = &parsed.tables[&parsed.table_names["b"]];
        assert_eq!(meta.schema, people());
        assert_eq!(parsed.next_table_oid, catalog.inner.read().next_table_oid);
        Ok(())
    }

    #[test]
    fn test_oids_survive_via_tail() -> Result<()> {
        let catalog = test_catalog();
        catalog.create_table("a", &people(), None)?;
        catalog.create_table("b", &people(), None)?;
        catalog.drop_table("a", None)?;
        catalog.drop_table("b", None)?;

        let image = build_catalog_page(&catalog.inner.read())?;
        let parsed = parse_catalog_page(image.as_slice().try_into()?)?;
        // dropped tables never give their oids back
        assert_eq!(parsed.next_table_oid, 3);
        Ok(())
    }

    #[test]
    fn test_index_registration() -> Result<()> {
        let catalog = test_catalog();
        catalog.create_table("t", &people(), None)?;
        let (oid, _tree) = catalog.create_index("t_id", "t", &[0])?;
        let meta = catalog.index_meta("t_id").unwrap();
        assert_eq!(meta.oid, oid);
        assert_eq!(meta.key_attrs, vec![0]);
        assert_eq!(meta.key_schema.fields[0].name, "id");

        let table_oid = catalog.table_oid("t").unwrap();
        assert_eq!(catalog.table_indexes(table_oid).len(), 1);

        catalog.drop_index("t_id")?;
        assert!(catalog.index_meta("t_id").is_none());
        Ok(())
    }

    #[test]
    fn test_multi_column_index_refused() -> Result<()> {
        let catalog = test_catalog();
        catalog.create_table("t", &people(), None)?;
        let err = catalog.create_index("t_all", "t", &[0, 1]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::Constraint(_))
        ));
        Ok(())
    }
}
