//! WebAssembly sandbox for plugin code
//!
//! A plugin is a core wasm module (text or binary). The only imports it can
//! link against are the capability functions in the `host` namespace; there
//! is no WASI, so a plugin has no file, socket or process access of its own.
//!
//! Guest ABI:
//! - exports `memory` and `alloc(len) -> ptr`
//! - every other export of type `(ptr, len) -> i64` is a callable method; it
//!   receives JSON arguments and returns `(ptr << 32) | len` of a JSON result
//! - string arguments (URLs, store keys) may be raw or JSON-encoded
//! - capability calls that answer (`http_get`, `http_post`, `store_get`)
//!   return a packed pointer to `{"ok": value}` or `{"err": message}`

use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use wasmtime::{
    Caller, Config, Engine, Extern, ExternType, Instance, Linker, Memory, Module, Store, TypedFunc,
};

use crate::error::{Result, WorkerError};

const HOST_MODULE: &str = "host";
const ALLOC_EXPORT: &str = "alloc";
const MEMORY_EXPORT: &str = "memory";

/// Capability surface handed to a plugin
///
/// Calls block the calling thread until answered; sandboxes run on the
/// blocking pool.
pub trait Capabilities: Send + Sync {
    fn log(&self, message: &str);
    fn http(&self, method: &str, url: &str, body: Option<Value>) -> std::result::Result<Value, String>;
    fn store_get(&self, key: &str) -> std::result::Result<Value, String>;
    fn store_set(&self, key: &str, value: Value);
}

struct HostState {
    capabilities: Arc<dyn Capabilities>,
}

/// Engine configured for metered plugin execution
pub fn engine() -> Result<Engine> {
    let mut config = Config::new();
    config.consume_fuel(true);
    Engine::new(&config).map_err(|e| WorkerError::Plugin(format!("engine setup failed: {}", e)))
}

/// A loaded plugin and its export bag
pub struct Sandbox {
    store: Store<HostState>,
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    methods: BTreeMap<String, TypedFunc<(i32, i32), i64>>,
    fuel: u64,
}

impl Sandbox {
    /// Compile and instantiate plugin source
    pub fn load(
        engine: &Engine,
        source: &[u8],
        capabilities: Arc<dyn Capabilities>,
        fuel: u64,
    ) -> Result<Self> {
        let module = Module::new(engine, source)
            .map_err(|e| WorkerError::Plugin(format!("invalid plugin module: {}", e)))?;

        let linker = capability_linker(engine)?;
        let mut store = Store::new(engine, HostState { capabilities });
        set_fuel(&mut store, fuel)?;

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| WorkerError::Plugin(format!("plugin failed to instantiate: {}", e)))?;

        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .ok_or_else(|| WorkerError::Plugin("plugin exports no memory".into()))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, ALLOC_EXPORT)
            .map_err(|e| WorkerError::Plugin(format!("plugin exports no alloc: {}", e)))?;

        let methods = collect_methods(&module, &instance, &mut store);
        debug!("Plugin loaded with methods: {:?}", methods.keys());

        Ok(Self {
            store,
            memory,
            alloc,
            methods,
            fuel,
        })
    }

    pub fn methods(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    /// Invoke an exported method with JSON arguments
    pub fn call(&mut self, method: &str, args: &Value) -> Result<Value> {
        let func = self
            .methods
            .get(method)
            .cloned()
            .ok_or_else(|| WorkerError::MethodNotFound(method.to_string()))?;

        set_fuel(&mut self.store, self.fuel)?;

        let input = serde_json::to_vec(args)?;
        let ptr = self
            .alloc
            .call(&mut self.store, guest_len(input.len())?)
            .map_err(|e| WorkerError::Plugin(format!("alloc trapped: {}", e)))?;
        self.memory
            .write(&mut self.store, ptr as u32 as usize, &input)
            .map_err(|e| WorkerError::Plugin(format!("argument write failed: {}", e)))?;

        let packed = func
            .call(&mut self.store, (ptr, guest_len(input.len())?))
            .map_err(|e| WorkerError::Plugin(format!("{} failed: {}", method, e)))?;

        let (out_ptr, out_len) = unpack(packed);
        if out_len == 0 {
            return Ok(Value::Null);
        }

        let mut output = vec![0u8; out_len];
        self.memory
            .read(&self.store, out_ptr, &mut output)
            .map_err(|e| WorkerError::Plugin(format!("result read failed: {}", e)))?;

        serde_json::from_slice(&output)
            .map_err(|e| WorkerError::Plugin(format!("{} returned invalid JSON: {}", method, e)))
    }
}

fn set_fuel(store: &mut Store<HostState>, fuel: u64) -> Result<()> {
    store
        .set_fuel(fuel)
        .map_err(|e| WorkerError::Plugin(format!("fuel setup failed: {}", e)))
}

/// Exports shaped like methods, excluding the allocator
fn collect_methods(
    module: &Module,
    instance: &Instance,
    store: &mut Store<HostState>,
) -> BTreeMap<String, TypedFunc<(i32, i32), i64>> {
    let names: Vec<String> = module
        .exports()
        .filter(|export| matches!(export.ty(), ExternType::Func(_)))
        .map(|export| export.name().to_string())
        .filter(|name| name != ALLOC_EXPORT)
        .collect();

    names
        .into_iter()
        .filter_map(|name| {
            let func = instance
                .get_typed_func::<(i32, i32), i64>(&mut *store, &name)
                .ok()?;
            Some((name, func))
        })
        .collect()
}

/// The whole import surface a plugin may link against
fn capability_linker(engine: &Engine) -> Result<Linker<HostState>> {
    let mut linker = Linker::new(engine);
    let setup = |e: wasmtime::Error| WorkerError::Plugin(format!("linker setup failed: {}", e));

    linker
        .func_wrap(
            HOST_MODULE,
            "log",
            |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
                let message = read_string(&mut caller, ptr, len)?;
                caller.data().capabilities.log(&message);
                Ok(())
            },
        )
        .map_err(setup)?;

    linker
        .func_wrap(
            HOST_MODULE,
            "http_get",
            |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<i64> {
                let url = text_arg(read_string(&mut caller, ptr, len)?);
                let response = caller.data().capabilities.http("GET", &url, None);
                respond(&mut caller, response)
            },
        )
        .map_err(setup)?;

    linker
        .func_wrap(
            HOST_MODULE,
            "http_post",
            |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<i64> {
                let request = read_string(&mut caller, ptr, len)?;
                let response = match serde_json::from_str::<Value>(&request) {
                    Ok(request) => match request.get("url").and_then(Value::as_str) {
                        Some(url) => caller.data().capabilities.http(
                            "POST",
                            url,
                            request.get("body").cloned(),
                        ),
                        None => Err("http_post needs a url".to_string()),
                    },
                    Err(e) => Err(format!("http_post request is not JSON: {}", e)),
                };
                respond(&mut caller, response)
            },
        )
        .map_err(setup)?;

    linker
        .func_wrap(
            HOST_MODULE,
            "store_get",
            |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<i64> {
                let key = text_arg(read_string(&mut caller, ptr, len)?);
                let response = caller.data().capabilities.store_get(&key);
                respond(&mut caller, response)
            },
        )
        .map_err(setup)?;

    linker
        .func_wrap(
            HOST_MODULE,
            "store_set",
            |mut caller: Caller<'_, HostState>,
             key_ptr: i32,
             key_len: i32,
             value_ptr: i32,
             value_len: i32|
             -> wasmtime::Result<()> {
                let key = text_arg(read_string(&mut caller, key_ptr, key_len)?);
                let raw = read_string(&mut caller, value_ptr, value_len)?;
                // Values that are not JSON are stored as strings
                let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
                caller.data().capabilities.store_set(&key, value);
                Ok(())
            },
        )
        .map_err(setup)?;

    Ok(linker)
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> wasmtime::Result<Memory> {
    caller
        .get_export(MEMORY_EXPORT)
        .and_then(Extern::into_memory)
        .ok_or_else(|| wasmtime::Error::msg("plugin exports no memory"))
}

fn read_string(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> wasmtime::Result<String> {
    if len < 0 {
        return Err(wasmtime::Error::msg("negative length"));
    }
    let memory = guest_memory(caller)?;
    let mut buffer = vec![0u8; len as usize];
    memory.read(&*caller, ptr as u32 as usize, &mut buffer)?;
    String::from_utf8(buffer).map_err(|_| wasmtime::Error::msg("string is not UTF-8"))
}

/// Text arguments may be passed raw or as a JSON string
fn text_arg(raw: String) -> String {
    serde_json::from_str::<String>(&raw).unwrap_or(raw)
}

/// Copy a response envelope into guest memory and return its packed location
fn respond(
    caller: &mut Caller<'_, HostState>,
    response: std::result::Result<Value, String>,
) -> wasmtime::Result<i64> {
    let envelope = match response {
        Ok(value) => json!({ "ok": value }),
        Err(message) => json!({ "err": message }),
    };
    let bytes = serde_json::to_vec(&envelope)?;
    let len = i32::try_from(bytes.len()).map_err(|_| wasmtime::Error::msg("response too large"))?;

    let alloc = caller
        .get_export(ALLOC_EXPORT)
        .and_then(Extern::into_func)
        .ok_or_else(|| wasmtime::Error::msg("plugin exports no alloc"))?
        .typed::<i32, i32>(&*caller)?;
    let ptr = alloc.call(&mut *caller, len)?;

    let memory = guest_memory(caller)?;
    memory.write(&mut *caller, ptr as u32 as usize, &bytes)?;
    Ok(pack(ptr, len))
}

fn guest_len(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| WorkerError::Plugin("payload too large for plugin".into()))
}

fn pack(ptr: i32, len: i32) -> i64 {
    (((ptr as u32) as i64) << 32) | (len as u32) as i64
}

fn unpack(packed: i64) -> (usize, usize) {
    let bits = packed as u64;
    ((bits >> 32) as usize, (bits & 0xffff_ffff) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        logs: Mutex<Vec<String>>,
    }

    impl Capabilities for Recording {
        fn log(&self, message: &str) {
            self.logs.lock().unwrap().push(message.to_string());
        }

        fn http(&self, _method: &str, url: &str, _body: Option<Value>) -> std::result::Result<Value, String> {
            Ok(json!({ "url": url }))
        }

        fn store_get(&self, _key: &str) -> std::result::Result<Value, String> {
            Err("empty".into())
        }

        fn store_set(&self, _key: &str, _value: Value) {}
    }

    /// Echoes its argument bytes back and logs them first
    const ECHO: &str = r#"
        (module
          (import "host" "log" (func $log (param i32 i32)))
          (memory (export "memory") 1)
          (global $next (mut i32) (i32.const 1024))
          (func (export "alloc") (param $len i32) (result i32)
            (local $ptr i32)
            (local.set $ptr (global.get $next))
            (global.set $next (i32.add (global.get $next) (local.get $len)))
            (local.get $ptr))
          (func (export "echo") (param $ptr i32) (param $len i32) (result i64)
            (call $log (local.get $ptr) (local.get $len))
            (i64.or
              (i64.shl (i64.extend_i32_u (local.get $ptr)) (i64.const 32))
              (i64.extend_i32_u (local.get $len))))
          (func (export "spin") (param i32 i32) (result i64)
            (loop $forever (br $forever))
            (i64.const 0))
          (func (export "crash") (param i32 i32) (result i64)
            unreachable))
    "#;

    fn load(source: &str) -> (Sandbox, Arc<Recording>) {
        let caps = Arc::new(Recording::default());
        let sandbox = Sandbox::load(&engine().unwrap(), source.as_bytes(), caps.clone(), 10_000_000)
            .unwrap();
        (sandbox, caps)
    }

    #[test]
    fn test_export_bag() {
        let (sandbox, _) = load(ECHO);
        assert_eq!(sandbox.methods(), vec!["crash", "echo", "spin"]);
    }

    #[test]
    fn test_echo_and_log() {
        let (mut sandbox, caps) = load(ECHO);
        let result = sandbox.call("echo", &json!({"q": "hello"})).unwrap();
        assert_eq!(result, json!({"q": "hello"}));
        assert_eq!(caps.logs.lock().unwrap().as_slice(), [r#"{"q":"hello"}"#]);
    }

    #[test]
    fn test_unknown_method() {
        let (mut sandbox, _) = load(ECHO);
        let err = sandbox.call("missing", &Value::Null).unwrap_err();
        assert!(matches!(err, WorkerError::MethodNotFound(m) if m == "missing"));
    }

    #[test]
    fn test_trap_and_fuel_exhaustion_are_errors() {
        let (mut sandbox, _) = load(ECHO);
        assert!(matches!(
            sandbox.call("crash", &Value::Null),
            Err(WorkerError::Plugin(_))
        ));
        assert!(matches!(
            sandbox.call("spin", &Value::Null),
            Err(WorkerError::Plugin(_))
        ));
        // Still usable afterwards
        assert_eq!(sandbox.call("echo", &json!(1)).unwrap(), json!(1));
    }

    #[test]
    fn test_foreign_imports_rejected() {
        let source = r#"
            (module
              (import "wasi_snapshot_preview1" "fd_write" (func (param i32 i32 i32 i32) (result i32)))
              (memory (export "memory") 1)
              (func (export "alloc") (param i32) (result i32) (i32.const 0)))
        "#;
        let caps = Arc::new(Recording::default());
        let result = Sandbox::load(&engine().unwrap(), source.as_bytes(), caps, 1_000_000);
        assert!(matches!(result, Err(WorkerError::Plugin(_))));
    }

    #[test]
    fn test_text_arg() {
        assert_eq!(text_arg(r#""http://x/a""#.into()), "http://x/a");
        assert_eq!(text_arg("http://x/a".into()), "http://x/a");
    }

    #[test]
    fn test_pack_unpack() {
        assert_eq!(unpack(pack(1024, 17)), (1024, 17));
        assert_eq!(unpack(0), (0, 0));
    }
}
