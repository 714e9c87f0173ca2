pub(crate) mod log_manager;
pub(crate) mod log_record;
pub(crate) mod recovery;

/// Log sequence number. Numbering starts at 1 so that a zeroed page
/// header reads as "never logged".
pub type Lsn = u32;
pub const INVALID_LSN: Lsn = u32::MAX;
pub const FIRST_LSN: Lsn = 1;
