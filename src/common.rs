pub(crate) mod debounce;
pub(crate) mod description_builder;
pub(crate) mod limiter;
pub(crate) mod retry;
