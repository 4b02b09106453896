/// The part of the training driver's state that optimizers consume.
///
/// The optimizer only ever reads it, the driver owns and mutates it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrainingState {
    /// The current base learning rate.
    pub eta: f32,
    /// The amount of updates done so far.
    pub batches: usize,
    /// Set by the driver when accumulated statistics must be dropped,
    /// e.g. after a learning rate restart.
    pub reset: bool,
}

/// Receives the training driver's lifecycle notifications.
///
/// Every method defaults to doing nothing so observers only implement the events
/// they care about.
pub trait TrainingObserver {
    fn init(&mut self, _state: &TrainingState) {}

    fn act_after_loaded(&mut self, _state: &TrainingState) {}

    fn act_after_epoch(&mut self, _state: &TrainingState) {}

    fn act_after_batches(&mut self, _state: &TrainingState) {}

    fn act_after_stalled(&mut self, _state: &TrainingState) {}
}
