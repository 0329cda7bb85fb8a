mod common;
mod live_sync;
