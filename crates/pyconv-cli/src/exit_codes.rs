//! Process exit codes. Scripts depend on these.

pub const SUCCESS: i32 = 0;
pub const CONVERSION_FAILED: i32 = 1; // At least one input did not convert
pub const CONFIG_ERROR: i32 = 2; // Bad config, unusable interpreter, or internal error
