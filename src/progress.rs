/// Snapshot reported to download progress callbacks after every chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    pub current: u64,
    pub total: Option<u64>,
}

impl Progress {
    /// Completion in `0.0..=100.0`, when the total size is known.
    pub fn percent(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(100.0),
            Some(total) => Some((self.current.min(total) as f64 / total as f64) * 100.0),
            None => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.total.is_some_and(|total| self.current >= total)
    }
}
