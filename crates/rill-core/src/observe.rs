//! Running a source to completion.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::cause::Cause;
use crate::context::Context;
use crate::fx::Fx;
use crate::scope::Scope;
use crate::sink::{Payload, Sink};

struct Observer<E, F> {
    on_value: F,
    failure: Mutex<Option<Cause<E>>>,
    scope: Scope,
}

#[async_trait]
impl<A, E, F> Sink<A, E> for Observer<E, F>
where
    A: Payload,
    E: Payload,
    F: Fn(A) + Send + Sync + 'static,
{
    async fn on_success(&self, value: A, _cx: &Context) {
        if self.failure.lock().is_none() {
            (self.on_value)(value);
        }
    }

    async fn on_failure(&self, cause: Cause<E>, _cx: &Context) {
        {
            let mut failure = self.failure.lock();
            if failure.is_some() {
                return;
            }
            *failure = Some(cause);
        }
        self.scope.close();
    }
}

/// Run `fx` in a child of `scope`, calling `on_value` for every value.
///
/// Resolves with `Ok(())` when `fx` completes, with its failure if it fails,
/// and with `Cause::Interrupt` if `scope` closes first.
pub async fn observe<A, E, X, F>(fx: &X, scope: &Scope, on_value: F) -> Result<(), Cause<E>>
where
    A: Payload,
    E: Payload,
    X: Fx<A, E> + ?Sized,
    F: Fn(A) + Send + Sync + 'static,
{
    let inner = scope.fork();
    let _guard = inner.guard();
    let observer = Arc::new(Observer {
        on_value,
        failure: Mutex::new(None),
        scope: inner.clone(),
    });

    let completed = inner
        .until_closed(fx.run(observer.clone(), inner.clone()))
        .await
        .is_some();

    if let Some(cause) = observer.failure.lock().take() {
        return Err(cause);
    }
    if completed {
        Ok(())
    } else {
        Err(Cause::Interrupt)
    }
}

/// Run `fx` to completion in a fresh root scope and gather its values.
pub async fn collect<A, E, X>(fx: &X) -> Result<Vec<A>, Cause<E>>
where
    A: Payload,
    E: Payload,
    X: Fx<A, E> + ?Sized,
{
    collect_in(fx, &Scope::new()).await
}

/// Run `fx` to completion in a child of `scope` and gather its values.
pub async fn collect_in<A, E, X>(fx: &X, scope: &Scope) -> Result<Vec<A>, Cause<E>>
where
    A: Payload,
    E: Payload,
    X: Fx<A, E> + ?Sized,
{
    let values = Arc::new(Mutex::new(Vec::new()));
    let sink = values.clone();
    observe(fx, scope, move |value| sink.lock().push(value)).await?;
    let collected = std::mem::take(&mut *values.lock());
    Ok(collected)
}

/// The first value of `fx`, stopping it afterwards. `None` if it completes
/// without emitting.
pub async fn first<A, E, X>(fx: &X) -> Result<Option<A>, Cause<E>>
where
    A: Payload,
    E: Payload,
    X: Fx<A, E> + ?Sized,
{
    let scope = Scope::new();
    let slot = Arc::new(Mutex::new(None));
    let writer = slot.clone();
    let stopper = scope.clone();
    let outcome = observe(fx, &scope, move |value| {
        writer.lock().get_or_insert(value);
        stopper.close();
    })
    .await;

    let value = slot.lock().take();
    match (value, outcome) {
        (Some(value), _) => Ok(Some(value)),
        (None, Ok(())) => Ok(None),
        (None, Err(cause)) => Err(cause),
    }
}

/// Run `fx` to completion, discarding its values.
pub async fn drain<A, E, X>(fx: &X) -> Result<(), Cause<E>>
where
    A: Payload,
    E: Payload,
    X: Fx<A, E> + ?Sized,
{
    observe(fx, &Scope::new(), |_| {}).await
}
