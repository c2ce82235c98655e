//! The module depository.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::ffi::CStr;
use std::os::raw::c_void;

use libloading::os::unix::{Library, RTLD_NOW};
use parking_lot::ReentrantMutex;
use tracing::{debug, error, info, warn};

use crate::error::Error;

/// Stack of RAII tokens returned by a module's initializers.
///
/// Tokens are dropped in reverse push order, so later initializers may
/// depend on the side effects of earlier ones.
#[derive(Default)]
pub struct HandleStack {
    tokens: Vec<Box<dyn Any + Send>>,
}

impl HandleStack {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a token; it is dropped when the owning module unloads.
    pub fn push(&mut self, token: Box<dyn Any + Send>) {
        self.tokens.push(token);
    }

    /// Number of live tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// True when no tokens are held.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn unwind(&mut self) {
        while let Some(token) = self.tokens.pop() {
            drop(token);
        }
    }
}

impl Drop for HandleStack {
    fn drop(&mut self) {
        self.unwind();
    }
}

/// An initializer a loaded library registers at its own static
/// initialization. Must be a plain function: its address identifies both
/// the registration and, via the loader, the library it belongs to.
pub type ModuleInit = fn(&mut HandleStack) -> Result<(), Error>;

/// One row of [`ModuleDepository::snapshot`].
#[derive(Debug, Clone)]
pub struct ModuleSnapshot {
    /// Opaque loader handle.
    pub handle: usize,
    /// Base address the library is mapped at.
    pub base_address: usize,
    /// Canonical path reported by the loader.
    pub real_path: String,
}

/// Registration key: range queries by `(base, priority)`, insertion order
/// as the tie-break.
type RaiiKey = (usize, i64, u64);

struct Module {
    handles: HandleStack,
    handle: usize,
    base_address: usize,
    real_path: String,
}

impl Drop for Module {
    fn drop(&mut self) {
        info!(real_path = %self.real_path, "Destructor of module");
        // RAII tokens unwind before the handle closes.
        self.handles.unwind();
        let library = unsafe { Library::from_raw(self.handle as *mut c_void) };
        if let Err(err) = library.close() {
            warn!(error = %err, "Error unloading dynamic library");
        }
    }
}

#[derive(Default)]
struct State {
    raii_map: BTreeMap<RaiiKey, ModuleInit>,
    raii_index: HashMap<usize, RaiiKey>,
    next_seq: u64,
    modules: HashMap<usize, Module>,
}

impl State {
    fn inits_for_base(&self, base: usize) -> Vec<ModuleInit> {
        self.raii_map
            .range((base, i64::MIN, u64::MIN)..=(base, i64::MAX, u64::MAX))
            .map(|(_, init)| *init)
            .collect()
    }
}

/// Loads shared libraries and tracks their lifetimes.
///
/// Modules are dropped (tokens unwound, handles closed) when they are
/// unloaded or when the depository stops.
pub struct ModuleDepository {
    // Loader calls are not reentrant-safe across threads, and a library's
    // constructors re-enter register_module_raii on the loading thread.
    inner: ReentrantMutex<RefCell<State>>,
}

impl ModuleDepository {
    /// Creates an empty depository.
    pub fn new() -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(State::default())),
        }
    }

    /// Announces the depository; modules load lazily afterwards.
    pub fn start(&self) {
        info!("Starting module depository...");
    }

    /// Unloads every module: each one unwinds its RAII stack in reverse
    /// and closes its library handle.
    pub fn stop(&self) {
        info!("Unloading all modules...");
        let guard = self.inner.lock();
        guard.borrow_mut().modules.clear();
    }

    /// Registers an initializer to run when the library containing it is
    /// loaded, ordered by ascending `priority` within that library.
    ///
    /// The containing library's base address is auto-detected from the
    /// function's own address. Fails if the address cannot be resolved or
    /// the function is already registered.
    pub fn register_module_raii(&self, init: ModuleInit, priority: i64) -> Result<(), Error> {
        let guard = self.inner.lock();
        let addr = init as usize;
        let info = dl_addr_info(addr as *const c_void)
            .ok_or_else(|| Error::Load("error getting base address".into()))?;

        let state = &mut *guard.borrow_mut();
        if state.raii_index.contains_key(&addr) {
            return Err(Error::Load("duplicate module initializer".into()));
        }
        let key = (info.base_address, priority, state.next_seq);
        state.next_seq += 1;
        state.raii_map.insert(key, init);
        state.raii_index.insert(addr, key);
        Ok(())
    }

    /// Removes a registration. An unknown initializer is logged at error
    /// level and otherwise ignored.
    pub fn unregister_module_raii(&self, init: ModuleInit) {
        let guard = self.inner.lock();
        let state = &mut *guard.borrow_mut();
        match state.raii_index.remove(&(init as usize)) {
            Some(key) => {
                state.raii_map.remove(&key);
            }
            None => {
                error!(addr = init as usize, "Module initializer not found");
            }
        }
    }

    /// Loads the library at `path` and returns its base address.
    ///
    /// Resolves all symbols eagerly and keeps the mapping resident across
    /// closes (`RTLD_NOW | RTLD_NODELETE`). If a module with the same base
    /// address is already loaded, logs and returns the existing one.
    /// Otherwise every initializer registered for this library's address
    /// range runs in ascending priority; their tokens form the module's
    /// RAII stack.
    pub fn load(&self, path: &str) -> Result<usize, Error> {
        let guard = self.inner.lock();
        info!(path, "Loading module");

        let library = unsafe { Library::open(Some(path), RTLD_NOW | libc::RTLD_NODELETE) }
            .map_err(|err| Error::Load(err.to_string()))?;
        // The conventional symbol used to discover where the loader put us.
        let init_sym = unsafe { library.get::<*mut c_void>(b"_init\0") }
            .map_err(|err| Error::Load(err.to_string()))?
            .into_raw();
        let info = dl_addr_info(init_sym as *const c_void)
            .ok_or_else(|| Error::Load("error resolving module base address".into()))?;

        if guard.borrow().modules.contains_key(&info.base_address) {
            warn!(path, "Module already loaded");
            // Drops our duplicate handle, balancing the loader refcount.
            return Ok(info.base_address);
        }

        info!(real_path = %info.real_path, "Initializing new module");
        let inits = guard.borrow().inits_for_base(info.base_address);
        let mut handles = HandleStack::new();
        for init in inits {
            debug!(addr = init as usize, "Performing module initialization");
            init(&mut handles)?;
        }
        info!(real_path = %info.real_path, "Done initializing module");

        let handle = library.into_raw() as usize;
        let module = Module {
            handles,
            handle,
            base_address: info.base_address,
            real_path: info.real_path.clone(),
        };
        guard.borrow_mut().modules.insert(info.base_address, module);
        info!(
            base_address = info.base_address,
            real_path = %info.real_path,
            "Loaded module"
        );
        Ok(info.base_address)
    }

    /// Like [`ModuleDepository::load`] but logs failures instead of
    /// returning them.
    pub fn load_nothrow(&self, path: &str) -> Option<usize> {
        match self.load(path) {
            Ok(base) => Some(base),
            Err(err) => {
                error!(path, error = %err, "Error loading module");
                None
            }
        }
    }

    /// Unloads the module at `base_address`.
    ///
    /// Returns whether a module was found; its RAII stack unwinds and its
    /// handle closes here, under the loader lock.
    ///
    /// The module's RAII destructors must not enqueue further operations
    /// into any daemon; doing so during unload is unsupported.
    pub fn unload(&self, base_address: usize) -> bool {
        let guard = self.inner.lock();
        let removed = guard.borrow_mut().modules.remove(&base_address);
        match removed {
            Some(module) => {
                info!(
                    base_address,
                    real_path = %module.real_path,
                    "Unloading module"
                );
                // Dropped here, under the loader lock.
                drop(module);
                true
            }
            None => {
                warn!(base_address, "Module not found");
                false
            }
        }
    }

    /// Lists the loaded modules.
    pub fn snapshot(&self) -> Vec<ModuleSnapshot> {
        let guard = self.inner.lock();
        let state = guard.borrow();
        state
            .modules
            .values()
            .map(|module| ModuleSnapshot {
                handle: module.handle,
                base_address: module.base_address,
                real_path: module.real_path.clone(),
            })
            .collect()
    }
}

impl Default for ModuleDepository {
    fn default() -> Self {
        Self::new()
    }
}

struct DlAddrInfo {
    base_address: usize,
    real_path: String,
}

/// Resolves the mapped object containing `addr` via the loader.
fn dl_addr_info(addr: *const c_void) -> Option<DlAddrInfo> {
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    if unsafe { libc::dladdr(addr, &mut info) } == 0 {
        return None;
    }
    let real_path = if info.dli_fname.is_null() {
        String::new()
    } else {
        unsafe { CStr::from_ptr(info.dli_fname) }
            .to_string_lossy()
            .into_owned()
    };
    Some(DlAddrInfo {
        base_address: info.dli_fbase as usize,
        real_path,
    })
}
