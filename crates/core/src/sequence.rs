pub type SeqId = u64;
pub type TokenId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    Waiting,
    Running,
    Finished,
}

impl SequenceStatus {
    pub fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Finished)
    }
}

/// One decoding branch of a request, as the block manager sees it: an id,
/// the tokens it has generated so far, and whether it is still running.
#[derive(Debug, Clone)]
pub struct Sequence {
    id: SeqId,
    generated_ids: Vec<TokenId>,
    status: SequenceStatus,
}

impl Sequence {
    pub fn new(id: SeqId) -> Self {
        Self {
            id,
            generated_ids: Vec::new(),
            status: SequenceStatus::Running,
        }
    }

    pub fn id(&self) -> SeqId {
        self.id
    }

    pub fn generated_ids(&self) -> &[TokenId] {
        &self.generated_ids
    }

    pub fn generated_len(&self) -> usize {
        self.generated_ids.len()
    }

    pub fn append_token(&mut self, token: TokenId) {
        self.generated_ids.push(token);
    }

    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    pub fn set_status(&mut self, status: SequenceStatus) {
        self.status = status;
    }
}

/// A request and its sibling sequences (e.g. beam-search branches). All
/// siblings share one prompt; the group tracks how many prompt tokens have
/// already been processed, which cache restoration advances.
#[derive(Debug, Clone)]
pub struct SequenceGroup {
    /// The originating request; by convention the id of the seed sequence.
    request_id: u64,
    prompt_ids: Vec<TokenId>,
    sequences: Vec<Sequence>,
    block_size: usize,
    num_processed_tokens: usize,
}

impl SequenceGroup {
    pub fn new(sequence: Sequence, prompt_ids: Vec<TokenId>, block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be non-zero");
        Self {
            request_id: sequence.id(),
            prompt_ids,
            sequences: vec![sequence],
            block_size,
            num_processed_tokens: 0,
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn prompt_ids(&self) -> &[TokenId] {
        &self.prompt_ids
    }

    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    pub fn add_sequence(&mut self, sequence: Sequence) {
        assert!(
            self.sequences.iter().all(|s| s.id() != sequence.id()),
            "sequence {} already belongs to the group",
            sequence.id()
        );
        self.sequences.push(sequence);
    }

    pub fn sequence(&self, id: SeqId) -> Option<&Sequence> {
        self.sequences.iter().find(|s| s.id() == id)
    }

    pub fn sequence_mut(&mut self, id: SeqId) -> Option<&mut Sequence> {
        self.sequences.iter_mut().find(|s| s.id() == id)
    }

    /// Sequences currently being decoded.
    pub fn running_sequences(&self) -> impl Iterator<Item = &Sequence> + '_ {
        self.sequences.iter().filter(|s| s.status().is_running())
    }

    /// Sequences that have not finished (running or parked).
    pub fn active_sequences(&self) -> impl Iterator<Item = &Sequence> + '_ {
        self.sequences.iter().filter(|s| !s.status().is_finished())
    }

    /// Block-sized windows the group's token timeline spans:
    /// ceil((prompt + longest active generation) / block_size).
    pub fn num_logical_blocks(&self) -> usize {
        let generated = self
            .active_sequences()
            .map(Sequence::generated_len)
            .max()
            .unwrap_or(0);
        (self.prompt_ids.len() + generated).div_ceil(self.block_size)
    }

    pub fn num_processed_tokens(&self) -> usize {
        self.num_processed_tokens
    }

    /// Advance the count of prompt tokens that need no recomputation.
    pub fn update_processed_tokens_num(&mut self, num_tokens: usize) {
        self.num_processed_tokens = num_tokens;
    }
}
