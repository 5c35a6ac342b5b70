//! Demonstration functions compiled into the worker binary for
//! operational smoke-testing. They double as integration-test fixtures.

use std::time::Duration;

use serde_json::{json, Value};

use crate::function::{JobContext, JobFunction, Priority};

/// Adds the `a` and `b` arguments.
#[derive(Default)]
pub struct Add;

impl JobFunction for Add {
    const NAME: &'static str = "Add";

    async fn run(&mut self, ctx: JobContext) -> Result<Value, String> {
        let a = ctx
            .arg("a")
            .and_then(Value::as_i64)
            .ok_or("missing numeric argument 'a'")?;
        let b = ctx
            .arg("b")
            .and_then(Value::as_i64)
            .ok_or("missing numeric argument 'b'")?;

        ctx.log_line(&format!("adding {a} + {b}")).map_err(|e| e.to_string())?;
        Ok(json!(a + b))
    }
}

/// Sings the song while reporting progress, one bottle per step.
#[derive(Default)]
pub struct NinetyNineBottlesOfBeer;

impl JobFunction for NinetyNineBottlesOfBeer {
    const NAME: &'static str = "NinetyNineBottlesOfBeer";
    const PRIORITY: Priority = Priority::Low;

    async fn run(&mut self, ctx: JobContext) -> Result<Value, String> {
        let bottles = ctx.arg("n").and_then(Value::as_u64).unwrap_or(99);

        for sung in 1..=bottles {
            let left = bottles - sung;
            ctx.log_line(&format!(
                "{left} bottles of beer on the wall, {left} bottles of beer"
            ))
            .map_err(|e| e.to_string())?;
            ctx.progress()
                .report(sung, bottles)
                .map_err(|e| e.to_string())?;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        Ok(json!(bottles))
    }
}

/// Fails on every attempt; exercises the retry loop and notification path.
#[derive(Default)]
pub struct AlwaysFails;

impl JobFunction for AlwaysFails {
    const NAME: &'static str = "AlwaysFails";
    const RETRIES: u32 = 3;

    async fn run(&mut self, _ctx: JobContext) -> Result<Value, String> {
        Err("this function always fails".to_string())
    }
}

/// Counts to `n` with progress; declared unique so concurrent submissions
/// with the same arguments collapse into one queue job.
#[derive(Default)]
pub struct Count;

impl JobFunction for Count {
    const NAME: &'static str = "Count";
    const UNIQUE: bool = true;

    async fn run(&mut self, ctx: JobContext) -> Result<Value, String> {
        let n = ctx
            .arg("n")
            .and_then(Value::as_u64)
            .ok_or("missing numeric argument 'n'")?;

        for i in 1..=n {
            ctx.progress().report(i, n).map_err(|e| e.to_string())?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        Ok(json!(n))
    }
}

/// Register every demo function.
pub fn register_all(registry: &mut crate::function::FunctionRegistry) {
    registry
        .register::<Add>()
        .register::<NinetyNineBottlesOfBeer>()
        .register::<AlwaysFails>()
        .register::<Count>();
}
