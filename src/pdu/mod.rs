pub mod factory;
pub mod header;
pub mod input_stream;
pub mod message;
pub mod output_stream;
pub mod payloads;
pub mod sequence;
pub mod verb_id;

pub const MAGIC: i32 = 0x0db2_d1e4;

/// major version in the high byte, minor version in the low byte
pub const PROTOCOL_VERSION: i16 = 3 << 8;

/// length of the fixed frame header, including the length field itself
pub const HEADER_LEN: usize = 54;
