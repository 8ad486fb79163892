use std::any::type_name;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

/// Folds inputs of type `I` into an accumulator `A` and extracts an `O`.
pub trait CombineFn<I, A, O>: Send + Sync + 'static {
    fn create(&self) -> A;

    fn add_input(&self, acc: &mut A, input: I);

    fn extract(&self, acc: &A) -> O;
}

/// Built-in combiner: sums all inputs.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sum;

impl<T> CombineFn<T, T, T> for Sum
where
    T: Copy + Default + std::ops::Add<Output = T> + Send + Sync + 'static,
{
    fn create(&self) -> T {
        T::default()
    }

    fn add_input(&self, acc: &mut T, input: T) {
        *acc = *acc + input;
    }

    fn extract(&self, acc: &T) -> T {
        *acc
    }
}

/// Built-in combiner: keeps the largest input, `None` until one arrives.
#[derive(Clone, Copy, Debug, Default)]
pub struct Max;

impl<T> CombineFn<T, Option<T>, Option<T>> for Max
where
    T: Copy + PartialOrd + Send + Sync + 'static,
{
    fn create(&self) -> Option<T> {
        None
    }

    fn add_input(&self, acc: &mut Option<T>, input: T) {
        if acc.is_none_or(|current| input > current) {
            *acc = Some(input);
        }
    }

    fn extract(&self, acc: &Option<T>) -> Option<T> {
        *acc
    }
}

/// Built-in combiner: keeps the smallest input, `None` until one arrives.
#[derive(Clone, Copy, Debug, Default)]
pub struct Min;

impl<T> CombineFn<T, Option<T>, Option<T>> for Min
where
    T: Copy + PartialOrd + Send + Sync + 'static,
{
    fn create(&self) -> Option<T> {
        None
    }

    fn add_input(&self, acc: &mut Option<T>, input: T) {
        if acc.is_none_or(|current| input < current) {
            *acc = Some(input);
        }
    }

    fn extract(&self, acc: &Option<T>) -> Option<T> {
        *acc
    }
}

pub(crate) trait TypedAccumulator<I, O>: Send + Sync {
    fn add(&self, input: I);

    fn value(&self) -> O;
}

/// The type-erased face of an accumulator, used for lookups by name.
pub(crate) trait ErasedAccumulator: Send + Sync {
    fn value_any(&self) -> Box<dyn std::any::Any + Send>;

    fn output_type_name(&self) -> &'static str;
}

pub(crate) struct Accumulator<I, A, O, C> {
    combine: C,
    acc: Mutex<A>,
    _phantom: PhantomData<fn(I) -> O>,
}

impl<I, A, O, C> Accumulator<I, A, O, C>
where
    C: CombineFn<I, A, O>,
{
    pub fn new(combine: C) -> Self {
        Self {
            acc: Mutex::new(combine.create()),
            combine,
            _phantom: PhantomData,
        }
    }
}

impl<I, A, O, C> TypedAccumulator<I, O> for Accumulator<I, A, O, C>
where
    A: Send,
    C: CombineFn<I, A, O>,
{
    fn add(&self, input: I) {
        let mut acc = self.acc.lock().unwrap_or_else(PoisonError::into_inner);
        self.combine.add_input(&mut acc, input);
    }

    fn value(&self) -> O {
        let acc = self.acc.lock().unwrap_or_else(PoisonError::into_inner);
        self.combine.extract(&acc)
    }
}

impl<I, A, O, C> ErasedAccumulator for Accumulator<I, A, O, C>
where
    A: Send,
    O: Send + 'static,
    C: CombineFn<I, A, O>,
{
    fn value_any(&self) -> Box<dyn std::any::Any + Send> {
        Box::new(TypedAccumulator::value(self))
    }

    fn output_type_name(&self) -> &'static str {
        type_name::<O>()
    }
}

/// A named running metric fed by transforms.
///
/// Cloning an `Aggregator` yields another handle to the same accumulator, so
/// a clone can be moved into dataset closures running on worker threads.
pub struct Aggregator<I, O> {
    pub(crate) name: Arc<str>,
    pub(crate) inner: Arc<dyn TypedAccumulator<I, O>>,
}

impl<I, O> Clone for Aggregator<I, O> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<I, O> Aggregator<I, O> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Feeds one input into the aggregator.
    pub fn add(&self, input: I) {
        self.inner.add(input);
    }
}

impl<I, O> std::fmt::Debug for Aggregator<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Aggregator({})", self.name)
    }
}

/// The values of one aggregator, keyed by the step that registered it.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorValues<O> {
    pub(crate) steps: BTreeMap<String, O>,
}

impl<O> AggregatorValues<O> {
    pub fn values_at_steps(&self) -> &BTreeMap<String, O> {
        &self.steps
    }

    pub fn values(&self) -> impl Iterator<Item = &O> {
        self.steps.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum() {
        let acc = Accumulator::<i64, i64, i64, _>::new(Sum);
        acc.add(2);
        acc.add(40);
        assert_eq!(TypedAccumulator::value(&acc), 42);
    }

    #[test]
    fn test_max_min() {
        let max = Accumulator::<u32, _, Option<u32>, _>::new(Max);
        let min = Accumulator::<u32, _, Option<u32>, _>::new(Min);
        assert_eq!(TypedAccumulator::value(&max), None);

        for x in [4, 9, 1] {
            max.add(x);
            min.add(x);
        }

        assert_eq!(TypedAccumulator::value(&max), Some(9));
        assert_eq!(TypedAccumulator::value(&min), Some(1));
    }

    #[test]
    fn test_erased_value() {
        let acc = Accumulator::<f64, f64, f64, _>::new(Sum);
        acc.add(0.5);

        let value = acc.value_any();
        assert_eq!(value.downcast_ref::<f64>(), Some(&0.5));
        assert_eq!(acc.output_type_name(), "f64");
    }
}
