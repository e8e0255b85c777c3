//! Media handling: the external transcoder boundary

pub mod transcoder;
