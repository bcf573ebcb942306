/// The stage of processing an input has reached
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum Stage {
    #[default]
    Decoding,
    Calculating,
    Writing,
    Done,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Decoding => "decoding",
            Self::Calculating => "calculating",
            Self::Writing => "writing",
            Self::Done => "done",
        }
    }
}

/// Progress message sent from a processing thread.
/// `progress` is the fraction of all inputs completed.
#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub progress: f32,
    pub input_index: usize,
    pub stage: Stage,
}

impl WorkerStatus {
    pub fn new(progress: f32, input_index: usize, stage: Stage) -> Self {
        Self {
            progress,
            input_index,
            stage,
        }
    }
}
