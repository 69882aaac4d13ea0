//! # Wasm plugin engine
//!
//! Per-route plugins run inside a sandboxed wasmtime runtime with async host
//! functions, so a guest is suspended (not a worker thread) while the host
//! awaits Redis or SQL I/O. CPU-bound guest execution yields cooperatively
//! through epoch interruption with a 10 ms tick.
//!
//! ## Guest ABI
//!
//! A plugin is a core Wasm module exporting:
//!
//! - `on_request() -> i32` (required) — 0 allows the request, any non-zero
//!   value denies it (the gateway answers 403).
//! - `agw_alloc(len: i32) -> i32` (optional) — returns a pointer to `len`
//!   writable bytes in linear memory. Required for host functions that return
//!   payloads; without it they fail with [`ERR_ALLOC`].
//! - `agw_on_configure(ptr: i32, len: i32)` (optional) — invoked once at
//!   instantiation with the route's plugin `config` map serialized as a JSON
//!   object and written into guest memory.
//!
//! Host imports live in the `"env"` module:
//!
//! - `agw_log(level: i32, ptr: i32, len: i32)` — levels 0..4 map to
//!   trace/debug/info/warn/error.
//! - `agw_get_header(name_ptr, name_len, out_ptr, out_cap) -> i32` — copies
//!   the request header value (names are matched case-insensitively) and
//!   returns the number of bytes written, 0 when the header is absent.
//! - `host_redis_command(name_ptr, name_len, cmd_ptr, cmd_len) -> i64`
//! - `host_db_query(name_ptr, name_len, sql_ptr, sql_len) -> i64`
//!
//! The two I/O imports return a packed `{ptr, len}` pair on success: the
//! payload is written into guest memory obtained via `agw_alloc` and the
//! return value is `(ptr << 32) | len`. `0` is a nil Redis reply. Negative
//! values are the `ERR_*` codes below, which lets a plugin distinguish an
//! error from an empty result and choose fail-open or fail-closed.

mod engine;
mod host;

pub use engine::{PluginEngine, PluginOutcome};
pub use host::HostContext;

/// Generic host-side failure.
pub const ERR_INTERNAL: i64 = -1;
/// The named Redis/database resource is not in the active snapshot.
pub const ERR_UNKNOWN_RESOURCE: i64 = -2;
/// The host call exceeded its deadline (500 ms Redis, 1 s SQL).
pub const ERR_TIMEOUT: i64 = -3;
/// The request was cancelled while the host call was in flight.
pub const ERR_CANCELLED: i64 = -4;
/// The query was rejected (write statements are not allowed).
pub const ERR_REJECTED: i64 = -5;
/// The guest does not export a usable `agw_alloc`.
pub const ERR_ALLOC: i64 = -6;

/// Pack a guest pointer and payload length into the i64 host-call result.
pub fn pack_ptr_len(ptr: u32, len: u32) -> i64 {
    ((ptr as i64) << 32) | (len as i64)
}

/// Inverse of [`pack_ptr_len`]; only meaningful for non-negative results.
pub fn unpack_ptr_len(packed: i64) -> (u32, u32) {
    ((packed >> 32) as u32, (packed & 0xffff_ffff) as u32)
}
