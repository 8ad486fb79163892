mod aggregator;

use std::any::type_name;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::core::Dynamic;
use crate::engine::Session;
use crate::error::AggregatorError;

use crate::runtime::aggregator::{Accumulator, ErasedAccumulator, TypedAccumulator};
pub use crate::runtime::aggregator::{Aggregator, AggregatorValues, CombineFn, Max, Min, Sum};

struct Registered {
    step: String,
    handle_type: &'static str,
    erased: Arc<dyn ErasedAccumulator>,
    /// `Aggregator<I, O>` handed out at registration.
    typed: Dynamic,
}

/// Per-run access to the engine session and to aggregator storage.
///
/// Created once per pipeline run and shared by every transform evaluated in
/// it. Only aggregator accumulation mutates it, and that goes through the
/// accumulators' own locks.
pub struct RuntimeContext {
    session: Session,
    aggregators: Mutex<BTreeMap<String, Registered>>,
}

impl RuntimeContext {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            aggregators: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn app_name(&self) -> &str {
        &self.session.config().app_name
    }

    /// Registers an aggregator under `name` for the transform `step`.
    ///
    /// Asking again for a name that is already registered returns a handle to
    /// the existing aggregator, provided the types agree.
    pub fn create_aggregator<I, A, O, C>(
        &self,
        step: &str,
        name: &str,
        combine: C,
    ) -> Result<Aggregator<I, O>, AggregatorError>
    where
        I: 'static,
        A: Send + 'static,
        O: Send + 'static,
        C: CombineFn<I, A, O>,
    {
        let mut aggregators = self
            .aggregators
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = aggregators.get(name) {
            return existing
                .typed
                .downcast_ref::<Aggregator<I, O>>()
                .cloned()
                .ok_or_else(|| AggregatorError::TypeMismatch {
                    name: name.to_string(),
                    expected: type_name::<Aggregator<I, O>>(),
                    found: existing.handle_type,
                });
        }

        let accumulator = Arc::new(Accumulator::new(combine));
        let inner: Arc<dyn TypedAccumulator<I, O>> = accumulator.clone();
        let aggregator = Aggregator {
            name: Arc::from(name),
            inner,
        };

        tracing::debug!(step, name, output = type_name::<O>(), "registered aggregator");

        aggregators.insert(
            name.to_string(),
            Registered {
                step: step.to_string(),
                handle_type: type_name::<Aggregator<I, O>>(),
                erased: accumulator,
                typed: Arc::new(aggregator.clone()),
            },
        );

        Ok(aggregator)
    }

    /// The current value of the aggregator registered under `name`.
    pub fn get_aggregator_value<T>(&self, name: &str) -> Result<T, AggregatorError>
    where
        T: 'static,
    {
        let aggregators = self
            .aggregators
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let registered = aggregators
            .get(name)
            .ok_or_else(|| AggregatorError::NotFound(name.to_string()))?;

        registered
            .erased
            .value_any()
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|_| AggregatorError::TypeMismatch {
                name: name.to_string(),
                expected: type_name::<T>(),
                found: registered.erased.output_type_name(),
            })
    }

    /// The values of `aggregator` at every step that registered it.
    pub fn get_aggregator_values<I, O>(
        &self,
        aggregator: &Aggregator<I, O>,
    ) -> Result<AggregatorValues<O>, AggregatorError> {
        let aggregators = self
            .aggregators
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let registered = aggregators
            .get(aggregator.name())
            .ok_or_else(|| AggregatorError::NotFound(aggregator.name().to_string()))?;

        if !std::ptr::addr_eq(Arc::as_ptr(&registered.erased), Arc::as_ptr(&aggregator.inner)) {
            return Err(AggregatorError::NotRegistered(aggregator.name().to_string()));
        }

        let mut steps = BTreeMap::new();
        steps.insert(registered.step.clone(), aggregator.inner.value());

        Ok(AggregatorValues { steps })
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> RuntimeContext {
        RuntimeContext::new(Session::local().unwrap())
    }

    #[test]
    fn test_value_by_name() {
        let runtime = runtime();
        let total: Aggregator<i64, i64> = runtime.create_aggregator("count", "total", Sum).unwrap();

        total.add(3);
        total.clone().add(4);

        assert_eq!(runtime.get_aggregator_value::<i64>("total").unwrap(), 7);
    }

    #[test]
    fn test_unknown_name() {
        let err = runtime().get_aggregator_value::<i64>("missing").unwrap_err();
        assert!(matches!(err, AggregatorError::NotFound(name) if name == "missing"));
    }

    #[test]
    fn test_value_type_mismatch() {
        let runtime = runtime();
        let _: Aggregator<i64, i64> = runtime.create_aggregator("s", "total", Sum).unwrap();

        let err = runtime.get_aggregator_value::<String>("total").unwrap_err();
        assert!(matches!(err, AggregatorError::TypeMismatch { found: "i64", .. }));
    }

    #[test]
    fn test_repeated_name_shares_accumulator() {
        let runtime = runtime();
        let a: Aggregator<u32, Option<u32>> = runtime.create_aggregator("s1", "peak", Max).unwrap();
        let b: Aggregator<u32, Option<u32>> = runtime.create_aggregator("s2", "peak", Max).unwrap();

        a.add(5);
        b.add(11);

        let values = runtime.get_aggregator_values(&a).unwrap();
        assert_eq!(values.values_at_steps().get("s1"), Some(&Some(11)));

        let err = runtime
            .create_aggregator::<u32, u32, u32, _>("s3", "peak", Sum)
            .unwrap_err();
        assert!(matches!(err, AggregatorError::TypeMismatch { .. }));
    }

    #[test]
    fn test_values_from_other_run() {
        let first = runtime();
        let second = runtime();

        let foreign: Aggregator<i64, i64> = first.create_aggregator("s", "total", Sum).unwrap();
        let _: Aggregator<i64, i64> = second.create_aggregator("s", "total", Sum).unwrap();

        let err = second.get_aggregator_values(&foreign).unwrap_err();
        assert!(matches!(err, AggregatorError::NotRegistered(_)));

        let err = runtime().get_aggregator_values(&foreign).unwrap_err();
        assert!(matches!(err, AggregatorError::NotFound(_)));
    }
}
