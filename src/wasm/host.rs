//! Host imports exposed to plugin instances.
//!
//! Every import is registered as an async function so the guest is suspended
//! across host I/O instead of blocking a worker thread. Payload-returning
//! imports write into guest memory obtained through the plugin's exported
//! `agw_alloc` and pack the `{ptr, len}` pair into their i64 result.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};
use wasmtime::{Caller, Linker, Memory};

use crate::dataplane::resources::{PoolError, RedisReply, SharedPools};
use crate::errors::{AgwError, Result};

use super::{pack_ptr_len, ERR_ALLOC, ERR_CANCELLED, ERR_INTERNAL, ERR_REJECTED, ERR_TIMEOUT, ERR_UNKNOWN_RESOURCE};

/// Total deadline for one `host_redis_command` call.
const REDIS_DEADLINE: Duration = Duration::from_millis(500);
/// Total deadline for one `host_db_query` call.
const SQL_DEADLINE: Duration = Duration::from_secs(1);

/// Per-instance state available to host functions.
pub struct HostContext {
    pub(crate) plugin_name: String,
    pub(crate) headers: HashMap<String, String>,
    pub(crate) pools: SharedPools,
    pub(crate) cancel: watch::Receiver<bool>,
}

impl HostContext {
    pub fn new(
        plugin_name: String,
        headers: HashMap<String, String>,
        pools: SharedPools,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self { plugin_name, headers, pools, cancel }
    }
}

/// Register all `env` imports on the linker.
pub fn add_host_functions(linker: &mut Linker<HostContext>) -> Result<()> {
    linker
        .func_wrap_async(
            "env",
            "agw_log",
            |mut caller: Caller<'_, HostContext>, (level, ptr, len): (i32, i32, i32)| {
                Box::new(async move {
                    let message = read_string(&mut caller, ptr, len).unwrap_or_default();
                    let plugin = caller.data().plugin_name.clone();
                    match level {
                        0 => trace!(plugin = %plugin, "{}", message),
                        1 => debug!(plugin = %plugin, "{}", message),
                        2 => info!(plugin = %plugin, "{}", message),
                        3 => warn!(plugin = %plugin, "{}", message),
                        _ => error!(plugin = %plugin, "{}", message),
                    }
                })
            },
        )
        .map_err(|e| AgwError::wasm(format!("failed to register agw_log: {}", e)))?;

    linker
        .func_wrap_async(
            "env",
            "agw_get_header",
            |mut caller: Caller<'_, HostContext>,
             (name_ptr, name_len, out_ptr, out_cap): (i32, i32, i32, i32)| {
                Box::new(async move {
                    let Some(name) = read_string(&mut caller, name_ptr, name_len) else {
                        return ERR_INTERNAL as i32;
                    };
                    let value =
                        caller.data().headers.get(&name.to_ascii_lowercase()).cloned();
                    let Some(value) = value else {
                        return 0;
                    };
                    let bytes = value.as_bytes();
                    let writable = bytes.len().min(out_cap.max(0) as usize);
                    let Some(memory) = guest_memory(&mut caller) else {
                        return ERR_INTERNAL as i32;
                    };
                    if out_ptr < 0
                        || memory.write(&mut caller, out_ptr as usize, &bytes[..writable]).is_err()
                    {
                        return ERR_INTERNAL as i32;
                    }
                    writable as i32
                })
            },
        )
        .map_err(|e| AgwError::wasm(format!("failed to register agw_get_header: {}", e)))?;

    linker
        .func_wrap_async(
            "env",
            "host_redis_command",
            |mut caller: Caller<'_, HostContext>,
             (name_ptr, name_len, cmd_ptr, cmd_len): (i32, i32, i32, i32)| {
                Box::new(async move {
                    let Some(name) = read_string(&mut caller, name_ptr, name_len) else {
                        return ERR_INTERNAL;
                    };
                    let Some(command) = read_string(&mut caller, cmd_ptr, cmd_len) else {
                        return ERR_INTERNAL;
                    };

                    let pools = caller.data().pools.clone();
                    let mut cancel = caller.data().cancel.clone();

                    let payload = tokio::select! {
                        result = tokio::time::timeout(
                            REDIS_DEADLINE,
                            pools.redis_command(&name, &command),
                        ) => match result {
                            Ok(Ok(RedisReply::Nil)) => return 0,
                            Ok(Ok(RedisReply::Payload(bytes))) => bytes,
                            Ok(Err(e)) => return pool_error_code(&e, "redis"),
                            Err(_) => return ERR_TIMEOUT,
                        },
                        _ = cancel.changed() => return ERR_CANCELLED,
                    };

                    write_payload(&mut caller, &payload).await
                })
            },
        )
        .map_err(|e| AgwError::wasm(format!("failed to register host_redis_command: {}", e)))?;

    linker
        .func_wrap_async(
            "env",
            "host_db_query",
            |mut caller: Caller<'_, HostContext>,
             (name_ptr, name_len, sql_ptr, sql_len): (i32, i32, i32, i32)| {
                Box::new(async move {
                    let Some(name) = read_string(&mut caller, name_ptr, name_len) else {
                        return ERR_INTERNAL;
                    };
                    let Some(sql) = read_string(&mut caller, sql_ptr, sql_len) else {
                        return ERR_INTERNAL;
                    };

                    let pools = caller.data().pools.clone();
                    let mut cancel = caller.data().cancel.clone();

                    let payload = tokio::select! {
                        result = tokio::time::timeout(
                            SQL_DEADLINE,
                            pools.sql_query(&name, &sql),
                        ) => match result {
                            Ok(Ok(bytes)) => bytes,
                            Ok(Err(e)) => return pool_error_code(&e, "sql"),
                            Err(_) => return ERR_TIMEOUT,
                        },
                        _ = cancel.changed() => return ERR_CANCELLED,
                    };

                    write_payload(&mut caller, &payload).await
                })
            },
        )
        .map_err(|e| AgwError::wasm(format!("failed to register host_db_query: {}", e)))?;

    Ok(())
}

fn pool_error_code(error: &PoolError, backend: &str) -> i64 {
    match error {
        PoolError::UnknownResource(_) => ERR_UNKNOWN_RESOURCE,
        PoolError::Rejected(_) => ERR_REJECTED,
        PoolError::Backend(message) => {
            warn!(backend = %backend, error = %message, "Host call failed");
            ERR_INTERNAL
        }
    }
}

fn guest_memory(caller: &mut Caller<'_, HostContext>) -> Option<Memory> {
    caller.get_export("memory").and_then(|e| e.into_memory())
}

fn read_bytes(caller: &mut Caller<'_, HostContext>, ptr: i32, len: i32) -> Option<Vec<u8>> {
    if ptr < 0 || len < 0 {
        return None;
    }
    let memory = guest_memory(caller)?;
    let data = memory.data(&caller);
    let start = ptr as usize;
    let end = start.checked_add(len as usize)?;
    data.get(start..end).map(|slice| slice.to_vec())
}

fn read_string(caller: &mut Caller<'_, HostContext>, ptr: i32, len: i32) -> Option<String> {
    String::from_utf8(read_bytes(caller, ptr, len)?).ok()
}

/// Copy `payload` into guest memory via the plugin's `agw_alloc` and pack the
/// resulting `{ptr, len}` into an i64.
async fn write_payload(caller: &mut Caller<'_, HostContext>, payload: &[u8]) -> i64 {
    if payload.len() > i32::MAX as usize {
        return ERR_INTERNAL;
    }
    let Some(alloc) = caller.get_export("agw_alloc").and_then(|e| e.into_func()) else {
        return ERR_ALLOC;
    };
    let alloc = match alloc.typed::<i32, i32>(&mut *caller) {
        Ok(func) => func,
        Err(_) => return ERR_ALLOC,
    };
    let ptr = match alloc.call_async(&mut *caller, payload.len() as i32).await {
        Ok(ptr) => ptr,
        Err(_) => return ERR_ALLOC,
    };
    if ptr < 0 {
        return ERR_ALLOC;
    }
    let Some(memory) = guest_memory(caller) else {
        return ERR_INTERNAL;
    };
    if memory.write(&mut *caller, ptr as usize, payload).is_err() {
        return ERR_INTERNAL;
    }
    pack_ptr_len(ptr as u32, payload.len() as u32)
}
