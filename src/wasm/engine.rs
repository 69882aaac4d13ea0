//! Plugin engine: module cache, per-request instantiation, chain execution.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use wasmtime::{Config, Engine, Instance, Linker, Module, Store};

use crate::dataplane::resources::SharedPools;
use crate::errors::{AgwError, Result};
use crate::proto;

use super::host::{add_host_functions, HostContext};

/// How often the engine epoch advances; CPU-bound guest code yields at this
/// granularity.
const EPOCH_TICK: Duration = Duration::from_millis(10);

enum ModuleEntry {
    Ready(Module),
    Failed(String),
}

/// Chain verdict for one request.
#[derive(Debug, PartialEq, Eq)]
pub enum PluginOutcome {
    /// Every plugin returned zero; the request proceeds upstream.
    Allow,
    /// The named plugin returned a non-zero code; the gateway answers 403.
    Deny { plugin: String, code: i32 },
}

/// Compiles and caches plugin modules and runs per-request instances.
///
/// The cache is keyed by wasm file path. A compile failure is recorded
/// against the path and every request routed through that plugin fails with
/// an engine error (the gateway answers 500) until a later snapshot
/// referencing the path triggers a successful re-compile.
pub struct PluginEngine {
    engine: Engine,
    linker: Linker<HostContext>,
    modules: RwLock<HashMap<String, ModuleEntry>>,
    pools: SharedPools,
}

impl PluginEngine {
    pub fn new(pools: SharedPools) -> Result<Self> {
        let mut config = Config::new();
        config.async_support(true);
        config.epoch_interruption(true);

        let engine = Engine::new(&config)
            .map_err(|e| AgwError::wasm(format!("failed to create wasm engine: {}", e)))?;

        let mut linker = Linker::new(&engine);
        add_host_functions(&mut linker)?;

        Ok(Self { engine, linker, modules: RwLock::new(HashMap::new()), pools })
    }

    /// Advance the epoch on a fixed tick so guest execution between host
    /// calls cannot hog a worker thread.
    pub fn start_epoch_ticker(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(EPOCH_TICK);
            loop {
                interval.tick().await;
                engine.increment_epoch();
            }
        })
    }

    /// Compile every module a snapshot references. Paths that previously
    /// failed get a fresh attempt; paths that still fail stay poisoned.
    pub fn preload(&self, snapshot: &proto::ConfigSnapshot) {
        let mut paths: HashSet<&str> = HashSet::new();
        for route in &snapshot.routes {
            for plugin in &route.plugins {
                paths.insert(plugin.wasm_path.as_str());
            }
        }

        for path in paths {
            let cached = {
                let modules = self.modules.read().unwrap();
                matches!(modules.get(path), Some(ModuleEntry::Ready(_)))
            };
            if cached {
                continue;
            }
            self.compile(path);
        }
    }

    fn compile(&self, path: &str) {
        match Module::from_file(&self.engine, path) {
            Ok(module) => {
                info!(path = %path, "Compiled wasm module");
                self.modules
                    .write()
                    .unwrap()
                    .insert(path.to_string(), ModuleEntry::Ready(module));
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Wasm module compilation failed");
                self.modules
                    .write()
                    .unwrap()
                    .insert(path.to_string(), ModuleEntry::Failed(e.to_string()));
            }
        }
    }

    fn module_for(&self, path: &str) -> Result<Module> {
        {
            let modules = self.modules.read().unwrap();
            match modules.get(path) {
                Some(ModuleEntry::Ready(module)) => return Ok(module.clone()),
                Some(ModuleEntry::Failed(message)) => {
                    return Err(AgwError::wasm(format!(
                        "module '{}' failed to compile: {}",
                        path, message
                    )));
                }
                None => {}
            }
        }

        // First use outside a preload pass.
        self.compile(path);
        let modules = self.modules.read().unwrap();
        match modules.get(path) {
            Some(ModuleEntry::Ready(module)) => Ok(module.clone()),
            Some(ModuleEntry::Failed(message)) => {
                Err(AgwError::wasm(format!("module '{}' failed to compile: {}", path, message)))
            }
            None => Err(AgwError::wasm(format!("module '{}' missing from cache", path))),
        }
    }

    /// Run a route's plugin chain in declared order. Each plugin completes
    /// (including all its host calls) before the next begins; the first
    /// non-zero verdict stops the chain.
    pub async fn run_chain(
        &self,
        plugins: &[proto::Plugin],
        headers: &HashMap<String, String>,
        cancel: watch::Receiver<bool>,
    ) -> Result<PluginOutcome> {
        for plugin in plugins {
            let code = self.run_plugin(plugin, headers, cancel.clone()).await?;
            if code != 0 {
                return Ok(PluginOutcome::Deny { plugin: plugin.name.clone(), code });
            }
        }
        Ok(PluginOutcome::Allow)
    }

    async fn run_plugin(
        &self,
        plugin: &proto::Plugin,
        headers: &HashMap<String, String>,
        cancel: watch::Receiver<bool>,
    ) -> Result<i32> {
        let module = self.module_for(&plugin.wasm_path)?;

        let context = HostContext::new(
            plugin.name.clone(),
            headers.clone(),
            self.pools.clone(),
            cancel,
        );

        let mut store = Store::new(&self.engine, context);
        store.set_epoch_deadline(1);
        store.epoch_deadline_async_yield_and_update(1);

        let instance = self
            .linker
            .instantiate_async(&mut store, &module)
            .await
            .map_err(|e| {
                AgwError::wasm(format!("plugin '{}' instantiation failed: {}", plugin.name, e))
            })?;

        self.configure_instance(&mut store, &instance, plugin).await?;

        let on_request = instance
            .get_typed_func::<(), i32>(&mut store, "on_request")
            .map_err(|e| {
                AgwError::wasm(format!("plugin '{}' has no on_request export: {}", plugin.name, e))
            })?;

        on_request
            .call_async(&mut store, ())
            .await
            .map_err(|e| AgwError::wasm(format!("plugin '{}' trapped: {}", plugin.name, e)))
    }

    /// Deliver the plugin `config` map at instantiation: serialized as JSON,
    /// written into memory from `agw_alloc`, handed to `agw_on_configure`.
    /// Plugins without those exports simply run unconfigured.
    async fn configure_instance(
        &self,
        store: &mut Store<HostContext>,
        instance: &Instance,
        plugin: &proto::Plugin,
    ) -> Result<()> {
        if plugin.config.is_empty() {
            return Ok(());
        }
        let Some(alloc) = instance.get_func(&mut *store, "agw_alloc") else {
            return Ok(());
        };
        let Some(configure) = instance.get_func(&mut *store, "agw_on_configure") else {
            return Ok(());
        };
        let Some(memory) = instance.get_memory(&mut *store, "memory") else {
            return Ok(());
        };

        let payload = serde_json::to_vec(&plugin.config)?;

        let alloc = alloc.typed::<i32, i32>(&*store).map_err(|e| {
            AgwError::wasm(format!("plugin '{}' agw_alloc has wrong type: {}", plugin.name, e))
        })?;
        let ptr = alloc.call_async(&mut *store, payload.len() as i32).await.map_err(|e| {
            AgwError::wasm(format!("plugin '{}' agw_alloc trapped: {}", plugin.name, e))
        })?;
        if ptr < 0 {
            return Err(AgwError::wasm(format!(
                "plugin '{}' agw_alloc returned an invalid pointer",
                plugin.name
            )));
        }

        memory.write(&mut *store, ptr as usize, &payload).map_err(|e| {
            AgwError::wasm(format!("plugin '{}' config write failed: {}", plugin.name, e))
        })?;

        let configure = configure.typed::<(i32, i32), ()>(&*store).map_err(|e| {
            AgwError::wasm(format!(
                "plugin '{}' agw_on_configure has wrong type: {}",
                plugin.name, e
            ))
        })?;
        configure.call_async(&mut *store, (ptr, payload.len() as i32)).await.map_err(|e| {
            AgwError::wasm(format!("plugin '{}' agw_on_configure trapped: {}", plugin.name, e))
        })?;

        Ok(())
    }
}
