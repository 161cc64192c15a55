use arena_proto::CheckpointResult;

/// Chronological checkpoint results. Hydrated history always precedes what
/// this session observed; hydration never touches local entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultLog {
    history: Vec<CheckpointResult>,
    local: Vec<CheckpointResult>,
}

impl ResultLog {
    pub fn hydrate(&mut self, history: Vec<CheckpointResult>) {
        self.history = history;
    }

    pub fn append(&mut self, results: impl IntoIterator<Item = CheckpointResult>) {
        self.local.extend(results);
    }

    pub fn entries(&self) -> Vec<CheckpointResult> {
        self.history.iter().chain(&self.local).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.history.len() + self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current status of a checkpoint: its most recent entry.
    pub fn latest(&self, checkpoint_id: &str) -> Option<&CheckpointResult> {
        self.history
            .iter()
            .chain(&self.local)
            .rev()
            .find(|result| result.checkpoint_id == checkpoint_id)
    }
}
