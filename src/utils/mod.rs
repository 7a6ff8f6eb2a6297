pub(crate) mod periodic;
pub(crate) mod retry;
