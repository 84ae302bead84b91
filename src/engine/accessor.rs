use tracing::{debug, info};

use super::RecurrentModel;
use crate::error::Result;

/// Builds the model the first time one is needed.
pub trait ModelFactory {
    type Model: RecurrentModel;

    /// Releases cached accelerator memory ahead of construction. Best effort.
    fn release_caches(&self) {}

    fn build(&self) -> Result<Self::Model>;
}

/// Owns the model handle and constructs it on first use.
///
/// Both controllers borrow the accessor mutably, which keeps a single
/// generation or chat turn in flight at a time. There is no teardown short of
/// dropping the accessor.
pub struct ModelAccessor<F: ModelFactory> {
    factory: F,
    model: Option<F::Model>,
}

impl<F: ModelFactory> ModelAccessor<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            model: None,
        }
    }

    /// Wraps an already constructed model.
    pub fn with_model(factory: F, model: F::Model) -> Self {
        Self {
            factory,
            model: Some(model),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Builds the model now instead of on the first request.
    pub fn initialize(&mut self) -> Result<()> {
        self.get().map(|_| ())
    }

    /// Returns the model, building it if this is the first call.
    ///
    /// A failed build leaves the accessor empty; the next call tries again.
    pub fn get(&mut self) -> Result<&mut F::Model> {
        let model = match self.model.take() {
            Some(model) => model,
            None => {
                debug!("releasing accelerator caches before model construction");
                self.factory.release_caches();
                info!("constructing model");
                self.factory.build()?
            }
        };

        Ok(self.model.insert(model))
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::engine::{ForwardOutput, ForwardRequest};
    use crate::error::Error;

    struct Counter(u32);

    impl RecurrentModel for Counter {
        type State = u32;

        fn reset_state(&mut self) {
            self.0 = 0;
        }

        fn empty_state(&self) -> u32 {
            0
        }

        fn load_context(&mut self, _text: &str) -> Result<()> {
            Ok(())
        }

        fn forward(&mut self, _request: &ForwardRequest<'_>) -> Result<ForwardOutput<u32>> {
            self.0 += 1;
            Ok(ForwardOutput {
                output: String::new(),
                state: self.0,
            })
        }

        fn set_state(&mut self, state: &u32) {
            self.0 = *state;
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        releases: Cell<u32>,
        builds: Cell<u32>,
        fail_first: bool,
    }

    impl ModelFactory for CountingFactory {
        type Model = Counter;

        fn release_caches(&self) {
            self.releases.set(self.releases.get() + 1);
        }

        fn build(&self) -> Result<Counter> {
            self.builds.set(self.builds.get() + 1);
            if self.fail_first && self.builds.get() == 1 {
                return Err(Error::Model("out of memory".into()));
            }
            Ok(Counter(0))
        }
    }

    #[test]
    fn builds_once_on_first_use() {
        let mut accessor = ModelAccessor::new(CountingFactory::default());
        assert!(!accessor.is_loaded());

        accessor.get().unwrap().set_state(&7);
        assert_eq!(accessor.get().unwrap().0, 7);

        assert!(accessor.is_loaded());
        assert_eq!(accessor.factory().builds.get(), 1);
        assert_eq!(accessor.factory().releases.get(), 1);
    }

    #[test]
    fn failed_build_is_retried() {
        let mut accessor = ModelAccessor::new(CountingFactory {
            fail_first: true,
            ..Default::default()
        });

        assert!(accessor.initialize().is_err());
        assert!(!accessor.is_loaded());
        assert!(accessor.initialize().is_ok());
        assert_eq!(accessor.factory().builds.get(), 2);
    }

    #[test]
    fn wrapped_model_skips_the_factory() {
        let mut accessor = ModelAccessor::with_model(CountingFactory::default(), Counter(3));
        assert_eq!(accessor.get().unwrap().0, 3);
        assert_eq!(accessor.factory().builds.get(), 0);
        assert_eq!(accessor.factory().releases.get(), 0);
    }
}
