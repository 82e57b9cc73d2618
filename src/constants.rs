pub const BYTES_PER_KB: usize = 1024;
pub const BYTES_PER_MB: usize = 1_048_576;
pub const PERCENT_100: f64 = 100.0;

// Memory ceilings
pub const DEFAULT_MEMORY_LIMIT_MB: usize = 100;
pub const DEFAULT_SHARDED_MEMORY_LIMIT_MB: usize = 200;
pub const MIN_MEMORY_LIMIT_BYTES: usize = 1024;
pub const MIN_MEMORY_LIMIT_PERCENT: f64 = 1.0;
pub const MAX_MEMORY_LIMIT_PERCENT: f64 = 90.0;

// Spill I/O
pub const DEFAULT_IO_BUFFER_SIZE_KB: usize = 64;
pub const MIN_IO_BUFFER_SIZE_KB: usize = 4;
pub const MAX_IO_BUFFER_SIZE_KB: usize = 16 * 1024;
pub const TEMP_DIR_NAME: &str = "aggspill_temp";
pub const TEMP_DIR_PREFIX: &str = "query-";
pub const RUN_FILE_PREFIX: &str = "run_";
pub const RUN_FILE_EXTENSION: &str = ".jsonl";
pub const DEFAULT_MERGE_FAN_IN: usize = 64;
pub const MIN_MERGE_FAN_IN: usize = 2;

// Top-k selection
pub const DEFAULT_TOP_K_DOCUMENT_ESTIMATE_BYTES: usize = 1024;
pub const MIN_TOP_K_DOCUMENT_ESTIMATE_BYTES: usize = 1;

// Footprint estimates for in-memory state
pub const VALUE_BASE_BYTES: usize = 16;
pub const DOCUMENT_BASE_BYTES: usize = 24;
pub const FIELD_BASE_BYTES: usize = 24;
pub const ACCUMULATOR_BASE_BYTES: usize = 16;
pub const GROUP_ENTRY_OVERHEAD_BYTES: usize = 64;
pub const SORT_ENTRY_OVERHEAD_BYTES: usize = 32;

// Error codes reported to clients
pub const INVALID_ARGUMENT_CODE: i32 = 2;
pub const INTERRUPTED_CODE: i32 = 11601;
pub const GROUP_MEMORY_EXCEEDED_CODE: i32 = 16945;
pub const SORT_MEMORY_EXCEEDED_CODE: i32 = 16819;
pub const SORT_LIMIT_MEMORY_EXCEEDED_CODE: i32 = 16820;
pub const SPILL_IO_ERROR_CODE: i32 = 16818;
