//! 数学插件
//! Math plugin
//!
//! A dynamic-library plugin exposing arithmetic in every export shape.
//! Build it as a cdylib and name the library under `[dependencies]` in
//! `gode.toml`, or put its directory in `plugins.search_paths`:
//!
//! ```toml
//! [dependencies]
//! math = "./target/debug/libgode_plugin_math.so"
//! ```
//!
//! Scripts then import it by its bare name:
//!
//! ```rhai
//! import "math" as math;
//!
//! print(math::add(2, 3));
//! math::add_async(10, 20, 200, |err, sum| print(`sum ${sum}`));
//! math::divide_later(1.0, 4.0).then(|q| print(`quotient ${q}`));
//! ```
//!
//! `import "plugin:math"` works only once the library has been activated,
//! e.g. by an earlier bare import or `ScriptEngineHost::load_plugin`.

use gode_kernel::{
    Completion, Deferred, ExportTable, HostCapability, NativeError, NativeFn, NativePlugin,
    ParamKind, Value,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Default)]
pub struct MathPlugin {
    capability: Option<HostCapability>,
    calls: Arc<AtomicI64>,
}

fn int_arg(args: &[Value], index: usize) -> Result<i64, NativeError> {
    args.get(index)
        .and_then(Value::as_int)
        .ok_or_else(|| NativeError::new(format!("argument {index} must be an int")))
}

fn number_arg(args: &[Value], index: usize) -> Result<f64, NativeError> {
    args.get(index)
        .and_then(Value::as_float)
        .ok_or_else(|| NativeError::new(format!("argument {index} must be a number")))
}

/// Int + Int stays Int; anything involving a Float widens.
fn add_values(a: &Value, b: &Value) -> Result<Value, NativeError> {
    match (a, b) {
        (Value::Int(a), Value::Int(b)) => a
            .checked_add(*b)
            .map(Value::Int)
            .ok_or_else(|| NativeError::new("integer overflow")),
        _ => {
            let (a, b) = (
                a.as_float().ok_or_else(|| NativeError::new("add expects numbers"))?,
                b.as_float().ok_or_else(|| NativeError::new("add expects numbers"))?,
            );
            Ok(Value::Float(a + b))
        }
    }
}

impl NativePlugin for MathPlugin {
    fn name(&self) -> &str {
        "math"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &str {
        "Arithmetic, synchronous and deferred"
    }

    fn initialize(&mut self, capability: HostCapability) -> Result<(), NativeError> {
        debug!("math plugin initialized");
        self.capability = Some(capability);
        Ok(())
    }

    fn exports(&self) -> ExportTable {
        let calls = self.calls.clone();

        ExportTable::new()
            .sync("add", [ParamKind::Number, ParamKind::Number], move |args| {
                calls.fetch_add(1, Ordering::Relaxed);
                add_values(&args[0], &args[1])
            })
            .sync("sqrt", [ParamKind::Float], |args| {
                let x = number_arg(&args, 0)?;
                if x < 0.0 {
                    return Err(NativeError::new(format!("cannot take the square root of {x}")));
                }
                Ok(Value::Float(x.sqrt()))
            })
            .sync("counter", [ParamKind::Int], |args| {
                let next = Arc::new(AtomicI64::new(int_arg(&args, 0)?));
                Ok(Value::from(NativeFn::new("counter", move |_| {
                    Ok(Value::Int(next.fetch_add(1, Ordering::SeqCst)))
                })))
            })
            .callback(
                "add_async",
                [ParamKind::Number, ParamKind::Number, ParamKind::Int],
                |args, done: Completion| {
                    let delay = int_arg(&args, 2)?.max(0) as u64;
                    let sum = add_values(&args[0], &args[1]);
                    thread::spawn(move || {
                        thread::sleep(Duration::from_millis(delay));
                        done.complete(sum);
                    });
                    Ok(())
                },
            )
            .callback(
                "multiply_async",
                [ParamKind::Int, ParamKind::Int],
                |args, done: Completion| {
                    let (a, b) = (int_arg(&args, 0)?, int_arg(&args, 1)?);
                    thread::spawn(move || {
                        if a < 0 || b < 0 {
                            done.fail("negative operand");
                        } else {
                            done.complete(
                                a.checked_mul(b)
                                    .map(Value::Int)
                                    .ok_or_else(|| NativeError::new("integer overflow")),
                            );
                        }
                    });
                    Ok(())
                },
            )
            .promise("divide_later", [ParamKind::Float, ParamKind::Float], |args| {
                let (a, b) = (number_arg(&args, 0)?, number_arg(&args, 1)?);
                if b == 0.0 {
                    return Ok(Deferred::rejected("division by zero"));
                }
                Ok(Deferred::new(move || {
                    thread::sleep(Duration::from_millis(5));
                    Ok(Value::Float(a / b))
                }))
            })
    }

    fn dispose(&mut self) -> Result<(), NativeError> {
        info!(
            "math plugin disposed after {} add calls",
            self.calls.load(Ordering::Relaxed)
        );
        self.capability = None;
        Ok(())
    }
}

gode_kernel::declare_plugin!(MathPlugin, MathPlugin::default());

#[cfg(test)]
mod tests {
    use super::*;
    use gode_kernel::ExportedFunction;
    use std::sync::mpsc;

    fn export(name: &str) -> ExportedFunction {
        MathPlugin::default()
            .exports()
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.function.clone())
            .unwrap()
    }

    fn call_sync(name: &str, args: Vec<Value>) -> Result<Value, NativeError> {
        match export(name) {
            ExportedFunction::Sync(f) => f(args),
            _ => panic!("{name} is not sync"),
        }
    }

    fn call_callback(name: &str, args: Vec<Value>) -> Result<Value, NativeError> {
        let (tx, rx) = mpsc::channel();
        let done = Completion::new(name, move |result| {
            let _ = tx.send(result);
        });
        match export(name) {
            ExportedFunction::CallbackAsync(f) => f(args, done).unwrap(),
            _ => panic!("{name} is not a callback export"),
        }
        rx.recv_timeout(Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn test_exports_cover_every_shape() {
        let table = MathPlugin::default().exports();
        assert_eq!(
            table.names(),
            vec!["add", "sqrt", "counter", "add_async", "multiply_async", "divide_later"]
        );
    }

    #[test]
    fn test_add_keeps_ints_and_widens_floats() {
        assert_eq!(call_sync("add", vec![Value::Int(2), Value::Int(3)]).unwrap(), Value::Int(5));
        assert_eq!(
            call_sync("add", vec![Value::Int(1), Value::Float(0.5)]).unwrap(),
            Value::Float(1.5)
        );
        assert!(call_sync("add", vec![Value::Int(i64::MAX), Value::Int(1)]).is_err());
    }

    #[test]
    fn test_sqrt_rejects_negatives() {
        assert_eq!(call_sync("sqrt", vec![Value::Float(9.0)]).unwrap(), Value::Float(3.0));
        let err = call_sync("sqrt", vec![Value::Float(-1.0)]).unwrap_err();
        assert!(err.to_string().contains("-1"));
    }

    #[test]
    fn test_counter_returns_stateful_function() {
        let counter = call_sync("counter", vec![Value::Int(7)]).unwrap();
        let f = match counter.as_callable() {
            Some(gode_kernel::Callable::Native(f)) => f.clone(),
            other => panic!("expected native function, got {other:?}"),
        };
        assert_eq!(f.call(vec![]).unwrap(), Value::Int(7));
        assert_eq!(f.call(vec![]).unwrap(), Value::Int(8));
    }

    #[test]
    fn test_add_async_completes_from_another_thread() {
        let sum = call_callback("add_async", vec![Value::Int(10), Value::Int(20), Value::Int(20)]);
        assert_eq!(sum.unwrap(), Value::Int(30));
    }

    #[test]
    fn test_multiply_async_reports_negative_operands() {
        let product = call_callback("multiply_async", vec![Value::Int(6), Value::Int(7)]);
        assert_eq!(product.unwrap(), Value::Int(42));

        let err = call_callback("multiply_async", vec![Value::Int(-5), Value::Int(3)]).unwrap_err();
        assert_eq!(err.to_string(), "negative operand");
    }

    #[test]
    fn test_divide_later_settles_deferred() {
        let ExportedFunction::PromiseReturning(divide) = export("divide_later") else {
            panic!("divide_later is not promise-returning");
        };
        let deferred = divide(vec![Value::Float(1.0), Value::Float(4.0)]).unwrap();
        assert_eq!(deferred.run().unwrap(), Value::Float(0.25));

        let deferred = divide(vec![Value::Float(1.0), Value::Float(0.0)]).unwrap();
        assert_eq!(deferred.run().unwrap_err().to_string(), "division by zero");
    }

    #[test]
    fn test_entry_points_report_metadata() {
        assert_eq!(gode_plugin_api_version(), gode_kernel::plugin::API_VERSION);
        assert_eq!(gode_plugin_name(), "math");
        assert_eq!(gode_plugin_version(), env!("CARGO_PKG_VERSION"));
        assert!(gode_plugin_dispose().is_ok());
    }
}
