pub(crate) mod metrics;
pub(crate) mod sink;
pub(crate) mod source;
