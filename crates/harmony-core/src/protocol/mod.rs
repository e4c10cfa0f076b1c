//! Protocol module: the wire codec, self-report decoding and the stanza model.

pub mod codec;
pub mod correlation;
pub mod report;
pub mod stanza;

pub use codec::{
    decode, encode, encode_fields, fields, try_decode, ProtocolError, WireMap, WireValue,
};
pub use correlation::CorrelationIds;
pub use report::decode_report;
pub use stanza::{ResponseBody, Stanza};
