//! In-process plugins shared by the host scenarios.

#![allow(dead_code)]

use gode_kernel::{
    Completion, Deferred, ExportTable, HostCapability, NativeError, NativeFn, NativePlugin,
    ParamKind, Value,
};
use gode_runtime::{HostConfig, ScriptEngineHost};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub type Log = Arc<Mutex<Vec<String>>>;

fn int(args: &[Value], index: usize) -> i64 {
    args[index].as_int().unwrap()
}

/// Arithmetic in every export shape.
pub struct Calc {
    capability: Option<HostCapability>,
    delivered: Log,
}

impl Calc {
    pub fn boxed() -> Box<Self> {
        Self::with_log(&Log::default())
    }

    pub fn with_log(delivered: &Log) -> Box<Self> {
        Box::new(Self {
            capability: None,
            delivered: delivered.clone(),
        })
    }
}

impl NativePlugin for Calc {
    fn name(&self) -> &str {
        "calc"
    }

    fn version(&self) -> &str {
        "1.2.0"
    }

    fn description(&self) -> &str {
        "arithmetic, now and later"
    }

    fn initialize(&mut self, capability: HostCapability) -> Result<(), NativeError> {
        self.capability = Some(capability);
        Ok(())
    }

    fn exports(&self) -> ExportTable {
        let capability = self.capability.clone();
        let delivered = self.delivered.clone();

        ExportTable::new()
            .sync("add", [ParamKind::Int, ParamKind::Int], |args| {
                Ok(Value::Int(int(&args, 0) + int(&args, 1)))
            })
            .sync("adder", [ParamKind::Int], |args| {
                let base = int(&args, 0);
                Ok(Value::from(NativeFn::new("adder", move |args| {
                    let n = args
                        .first()
                        .and_then(Value::as_int)
                        .ok_or_else(|| NativeError::new("adder expects an int"))?;
                    Ok(Value::Int(base + n))
                })))
            })
            .callback(
                "add_after",
                [ParamKind::Int, ParamKind::Int, ParamKind::Int],
                |args, done: Completion| {
                    let (a, b, ms) = (int(&args, 0), int(&args, 1), int(&args, 2));
                    thread::spawn(move || {
                        thread::sleep(Duration::from_millis(ms as u64));
                        done.succeed(a + b);
                    });
                    Ok(())
                },
            )
            .callback(
                "multiply_async",
                [ParamKind::Int, ParamKind::Int],
                |args, done: Completion| {
                    let (a, b) = (int(&args, 0), int(&args, 1));
                    thread::spawn(move || {
                        if a < 0 || b < 0 {
                            done.fail("negative operand");
                            // A second report must not reach the script.
                            done.succeed(a * b);
                        } else {
                            done.succeed(a * b);
                        }
                    });
                    Ok(())
                },
            )
            .promise("square_later", [ParamKind::Int], |args| {
                let x = int(&args, 0);
                Ok(Deferred::new(move || {
                    thread::sleep(Duration::from_millis(10));
                    Ok(Value::Int(x * x))
                }))
            })
            .promise("refuse", [ParamKind::String], |args| {
                let reason = args[0].as_str().unwrap_or_default().to_string();
                Ok(Deferred::rejected(reason))
            })
            .sync("burst", [ParamKind::Int], move |args| {
                let capability = capability
                    .clone()
                    .ok_or_else(|| NativeError::new("not initialized"))?;
                let count = int(&args, 0);
                let delivered = delivered.clone();
                let ticket = capability.keep_alive();
                thread::spawn(move || {
                    let _ticket = ticket;
                    for i in 0..count {
                        let delivered = delivered.clone();
                        capability.submit(move || delivered.lock().push(i.to_string()));
                    }
                });
                Ok(Value::Null)
            })
    }
}

/// Records its disposal; optionally fails to initialize or dispose.
pub struct Recorder {
    pub name: &'static str,
    pub fail_init: bool,
    pub fail_dispose: bool,
    pub log: Log,
}

impl Recorder {
    pub fn boxed(name: &'static str, log: &Log) -> Box<Self> {
        Box::new(Self {
            name,
            fail_init: false,
            fail_dispose: false,
            log: log.clone(),
        })
    }
}

impl NativePlugin for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn initialize(&mut self, _: HostCapability) -> Result<(), NativeError> {
        if self.fail_init {
            return Err(NativeError::new("missing configuration"));
        }
        Ok(())
    }

    fn exports(&self) -> ExportTable {
        let name = self.name;
        ExportTable::new().sync("hello", [], move |_| Ok(Value::from(format!("hello from {}", name))))
    }

    fn dispose(&mut self) -> Result<(), NativeError> {
        self.log.lock().push(self.name.to_string());
        if self.fail_dispose {
            return Err(NativeError::new("still busy"));
        }
        Ok(())
    }
}

pub fn host_in(dir: &Path) -> ScriptEngineHost {
    ScriptEngineHost::new(HostConfig {
        base_dir: Some(dir.to_path_buf()),
        ..HostConfig::default()
    })
    .unwrap()
}

pub fn host_with_calc(dir: &Path) -> ScriptEngineHost {
    let mut host = host_in(dir);
    host.register_plugin(Calc::boxed()).unwrap();
    host
}
