use anyhow::Result;
use charms_data::{is_simple_transfer, util, App, Data, Transaction, B32, TOKEN};
use sha2::{Digest, Sha256};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, RwLock},
};
use thiserror::Error;
use wasmi::{core::TrapCode, Caller, Config, Engine, Extern, Linker, Memory, Module, Store};

/// Why an app run did not accept the transaction.
#[derive(Debug, Error)]
pub enum RunError {
    /// A charm payload does not have the shape the app's tag requires.
    /// Detected before entering the VM.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// The app ran out of its instruction budget. Definitive rejection,
    /// not retryable.
    #[error("instruction budget of {budget} exceeded by app {app}")]
    BudgetExceeded { app: App, budget: u64 },

    /// The app aborted: the transition is invalid per its logic.
    #[error("app {app} rejected the transaction: {reason}")]
    Rejected { app: App, reason: String },

    /// The app trapped inside the VM (invalid memory access and the like).
    #[error("app {app} trapped: {reason}")]
    Trap { app: App, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Deterministic, fuel-bounded executor of app binaries (wasm32-wasip1).
///
/// The app reads CBOR-encoded `(app, tx, public_input, private_input)` from
/// stdin and accepts the transaction by returning from `_start` normally.
/// Aborting (e.g. a failed assertion) rejects it. There is no other I/O:
/// stderr is captured, clocks and randomness are not provided, so a run is a
/// pure function of its inputs.
pub struct AppRunner {
    engine: Engine,
    // compiled modules, content-addressed by app VK; populated once per VK
    modules: RwLock<BTreeMap<B32, Arc<Module>>>,
}

#[derive(Clone)]
struct HostState {
    stdin: Arc<Mutex<Vec<u8>>>,
    stderr: Arc<Mutex<Vec<u8>>>,
}

fn read_i32(memory: &Memory, caller: &mut Caller<'_, HostState>, ptr: i32) -> Result<i32> {
    let data = read_memory(memory, caller, ptr as usize, 4)?;
    Ok(i32::from_le_bytes(data.try_into().expect("4 bytes")))
}

fn write_i32(
    memory: &Memory,
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    value: i32,
) -> Result<()> {
    let data = value.to_le_bytes();
    write_memory(memory, caller, ptr as usize, &data)
}

fn read_memory(
    memory: &Memory,
    caller: &mut Caller<'_, HostState>,
    ptr: usize,
    len: usize,
) -> Result<Vec<u8>> {
    let mut buffer = vec![0; len];
    memory.read(caller, ptr, &mut buffer)?;
    Ok(buffer)
}

fn write_memory(
    memory: &Memory,
    caller: &mut Caller<'_, HostState>,
    ptr: usize,
    data: &[u8],
) -> Result<()> {
    memory.write(caller, ptr, data)?;
    Ok(())
}

fn fd_read_impl(
    mut caller: Caller<'_, HostState>,
    fd: i32,
    iovs: i32,
    iovs_len: i32,
    nread: i32,
) -> Result<i32> {
    if fd != 0 {
        return Ok(-1); // only stdin
    }

    let memory = caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| anyhow::anyhow!("no memory export"))?;

    let iov_size = 8;
    let mut iov_info = Vec::new();
    for i in 0..iovs_len {
        let iov_addr = iovs + i * iov_size;
        let buf_ptr = read_i32(&memory, &mut caller, iov_addr)? as usize;
        let buf_len = read_i32(&memory, &mut caller, iov_addr + 4)? as usize;
        iov_info.push((buf_ptr, buf_len));
    }

    let (operations, total_read) = {
        let state = caller.data();
        let mut stdin = state.stdin.lock().expect("stdin lock");

        let mut total_read = 0;
        let mut operations = Vec::new();
        for (buf_ptr, buf_len) in iov_info {
            let to_read = buf_len.min(stdin.len());
            if to_read == 0 {
                break;
            }
            let data = stdin.drain(..to_read).collect::<Vec<_>>();
            operations.push((buf_ptr, data));
            total_read += to_read;
        }
        (operations, total_read)
    };

    for (buf_ptr, data) in operations {
        write_memory(&memory, &mut caller, buf_ptr, &data)?;
    }
    write_i32(&memory, &mut caller, nread, total_read as i32)?;

    Ok(0)
}

fn fd_write_impl(
    mut caller: Caller<'_, HostState>,
    fd: i32,
    iovs: i32,
    iovs_len: i32,
    nwritten: i32,
) -> Result<i32> {
    if fd != 2 {
        return Ok(-1); // only stderr
    }

    let memory = caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| anyhow::anyhow!("no memory export"))?;

    let iov_size = 8;
    let mut total_written = 0;
    let mut all_data = Vec::new();
    for i in 0..iovs_len {
        let iov_addr = iovs + i * iov_size;
        let buf_ptr = read_i32(&memory, &mut caller, iov_addr)? as usize;
        let buf_len = read_i32(&memory, &mut caller, iov_addr + 4)? as usize;
        let data = read_memory(&memory, &mut caller, buf_ptr, buf_len)?;
        all_data.extend_from_slice(&data);
        total_written += buf_len;
    }

    {
        let state = caller.data_mut();
        let mut stderr = state.stderr.lock().expect("stderr lock");
        stderr.extend_from_slice(&all_data);
    }
    write_i32(&memory, &mut caller, nwritten, total_written as i32)?;

    Ok(0)
}

fn fd_read(caller: Caller<'_, HostState>, fd: i32, iovs: i32, iovs_len: i32, nread: i32) -> i32 {
    fd_read_impl(caller, fd, iovs, iovs_len, nread).unwrap_or(-1)
}

fn fd_write(
    caller: Caller<'_, HostState>,
    fd: i32,
    iovs: i32,
    iovs_len: i32,
    nwritten: i32,
) -> i32 {
    fd_write_impl(caller, fd, iovs, iovs_len, nwritten).unwrap_or(-1)
}

/// Instruction budget per single app run.
pub const MAX_FUEL_PER_RUN: u64 = 1_000_000_000;

impl AppRunner {
    pub fn new() -> Self {
        let mut config = Config::default();
        config.consume_fuel(true);
        Self {
            engine: Engine::new(&config),
            modules: RwLock::new(BTreeMap::new()),
        }
    }

    /// VK of an app binary: SHA-256 of its bytes.
    pub fn vk(&self, binary: &[u8]) -> B32 {
        let hash = Sha256::digest(binary);
        B32(hash.into())
    }

    /// Get the compiled module for the given VK, compiling and caching it on
    /// first use. The cache is never invalidated within the process lifetime.
    fn module(&self, vk: &B32, binary: &[u8]) -> Result<Arc<Module>> {
        if let Some(module) = self.modules.read().expect("module cache lock").get(vk) {
            return Ok(module.clone());
        }
        let module = Arc::new(Module::new(&self.engine, binary)?);
        let mut modules = self.modules.write().expect("module cache lock");
        Ok(modules.entry(vk.clone()).or_insert(module).clone())
    }

    /// Run one app against the transaction. Returns the fuel spent.
    #[tracing::instrument(level = "debug", skip_all, fields(%app))]
    pub fn run(
        &self,
        app_binary: &[u8],
        app: &App,
        tx: &Transaction,
        x: &Data,
        w: &Data,
    ) -> Result<u64, RunError> {
        let vk = self.vk(app_binary);
        if app.vk != vk {
            return Err(RunError::Other(anyhow::anyhow!(
                "app.vk does not match the provided binary for app {}",
                app
            )));
        }

        let stdin_content = util::write(&(app, tx, x, w))?;

        let state = HostState {
            stdin: Arc::new(Mutex::new(stdin_content)),
            stderr: Arc::new(Mutex::new(Vec::new())),
        };

        let mut store = Store::new(&self.engine, state.clone());
        store
            .set_fuel(MAX_FUEL_PER_RUN)
            .map_err(|e| anyhow::anyhow!("set_fuel: {}", e))?;
        let mut linker = Linker::new(&self.engine);

        (|| -> Result<()> {
            linker.func_wrap("wasi_snapshot_preview1", "fd_write", fd_write)?;
            linker.func_wrap("wasi_snapshot_preview1", "fd_read", fd_read)?;
            linker.func_wrap(
                "wasi_snapshot_preview1",
                "environ_get",
                |_: Caller<'_, HostState>, _: i32, _: i32| -> i32 { -1 },
            )?;
            linker.func_wrap(
                "wasi_snapshot_preview1",
                "environ_sizes_get",
                |_: Caller<'_, HostState>, _: i32, _: i32| -> i32 { -1 },
            )?;
            linker.func_wrap(
                "wasi_snapshot_preview1",
                "proc_exit",
                |_: Caller<'_, HostState>, _: i32| {},
            )?;
            Ok(())
        })()?;

        let module = self.module(&app.vk, app_binary)?;

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| anyhow::anyhow!("instantiate: {}", e))?
            .start(&mut store)
            .map_err(|e| anyhow::anyhow!("start: {}", e))?;

        let main_func = instance
            .get_func(&store, "_start")
            .ok_or_else(|| anyhow::anyhow!("app binary does not export _start"))?;
        let result = main_func
            .typed::<(), ()>(&store)
            .map_err(|e| anyhow::anyhow!("_start signature: {}", e))?
            .call(&mut store, ());

        if let Err(e) = result {
            let stderr = state.stderr.lock().expect("stderr lock");
            let reason = match String::from_utf8_lossy(&stderr).trim() {
                "" => e.to_string(),
                s => s.to_string(),
            };
            return Err(match e.as_trap_code() {
                Some(TrapCode::OutOfFuel) => RunError::BudgetExceeded {
                    app: app.clone(),
                    budget: MAX_FUEL_PER_RUN,
                },
                Some(TrapCode::UnreachableCodeReached) => RunError::Rejected {
                    app: app.clone(),
                    reason,
                },
                _ => RunError::Trap {
                    app: app.clone(),
                    reason,
                },
            });
        }

        let fuel_spent = MAX_FUEL_PER_RUN
            - store
                .get_fuel()
                .map_err(|e| anyhow::anyhow!("get_fuel: {}", e))?;
        tracing::debug!(fuel_spent, "app contract satisfied");
        Ok(fuel_spent)
    }

    /// Run all apps of the transaction. Apps without a binary are accepted
    /// only if the transaction is a simple transfer for them.
    /// Returns fuel spent per app, in `app_public_inputs` order.
    pub fn run_all(
        &self,
        app_binaries: &BTreeMap<B32, Vec<u8>>,
        tx: &Transaction,
        app_public_inputs: &BTreeMap<App, Data>,
        app_private_inputs: &BTreeMap<App, Data>,
    ) -> Result<Vec<u64>, RunError> {
        let empty = Data::empty();
        app_public_inputs
            .iter()
            .map(|(app, x)| {
                check_payload_schema(app, tx)?;
                let w = app_private_inputs.get(app).unwrap_or(&empty);
                match app_binaries.get(&app.vk) {
                    Some(app_binary) => self.run(app_binary, app, tx, x, w),
                    None => {
                        if !is_simple_transfer(app, tx) {
                            return Err(RunError::Rejected {
                                app: app.clone(),
                                reason: "not a simple transfer, but no binary provided"
                                    .to_string(),
                            });
                        }
                        tracing::debug!(%app, "simple transfer ok");
                        Ok(0)
                    }
                }
            })
            .collect()
    }
}

impl Default for AppRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Check charm payloads against the shape the app's tag mandates, before any
/// VM work: token charms must carry a u64 amount.
fn check_payload_schema(app: &App, tx: &Transaction) -> Result<(), RunError> {
    if app.tag != TOKEN {
        return Ok(());
    }
    let charms_of_app = tx
        .ins
        .iter()
        .chain(tx.refs.iter())
        .map(|(_, charms)| charms)
        .chain(tx.outs.iter());
    for charms in charms_of_app {
        if let Some(data) = charms.get(app) {
            data.value::<u64>().map_err(|_| {
                RunError::SchemaMismatch(format!(
                    "token charm of app {} does not carry a u64 amount",
                    app
                ))
            })?;
        }
    }
    Ok(())
}
