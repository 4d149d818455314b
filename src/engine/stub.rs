//! Scripted engine for tests
//!
//! Byte-level vocabulary: ids `0..256` are single bytes, followed by an
//! end-of-generation id, a BOS id and any extra multi-byte pieces. Each decode
//! produces logits that favour the next token of the script.

use std::cell::{Cell, RefCell};
use std::path::Path;
use std::rc::Rc;

use crate::engine::{
    ContextParams, DecodeBatch, DecodeContext, EngineError, InferenceEngine, ModelParams, Token,
    Vocabulary,
};

pub(crate) const EOG: Token = Token(256);
pub(crate) const BOS: Token = Token(257);
pub(crate) const FIRST_EXTRA: i32 = 258;

/// Score given to the scripted token; everything else gets 0.0.
const TARGET_LOGIT: f32 = 10.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    BackendInit,
    BackendFree,
    ModelLoad,
    ModelFree,
    ContextCreate,
    ContextFree,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Script {
    /// Tokens emitted in order, one per decode
    pub plan: Vec<Token>,
    /// Emitted once `plan` runs out; `None` emits end-of-generation
    pub fallback: Option<Token>,
    pub extra_pieces: Vec<Vec<u8>>,
    /// Once `plan` runs out, decodes score these tokens (all others 0.0)
    /// instead of emitting `fallback`
    pub scores: Vec<(Token, f32)>,
    pub fail_load: bool,
    /// Fail context creation once this many contexts have been created
    pub fail_context_after: Option<usize>,
    /// Fail the n-th decode of a context (0 = prompt decode)
    pub fail_decode_at: Option<usize>,
    /// Drop logits after the n-th decode of a context
    pub withhold_logits_at: Option<usize>,
    /// Tokenizer emits two tokens per byte
    pub doubled_tokens: bool,
    pub panic_on_tokenize: bool,
}

impl Script {
    /// Emits the bytes of `text` one token each, then end-of-generation.
    pub fn emitting(text: &str) -> Self {
        Self {
            plan: text.bytes().map(|b| Token(b as i32)).collect(),
            ..Self::default()
        }
    }

    /// Emits `token` forever.
    pub fn repeating(token: Token) -> Self {
        Self {
            fallback: Some(token),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Probe {
    events: RefCell<Vec<Event>>,
    batches: RefCell<Vec<DecodeBatch>>,
    contexts_created: Cell<usize>,
    tokenize_calls: Cell<usize>,
}

impl Probe {
    fn record(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub fn batches(&self) -> Vec<DecodeBatch> {
        self.batches.borrow().clone()
    }

    pub fn tokenize_calls(&self) -> usize {
        self.tokenize_calls.get()
    }

    pub fn live_contexts(&self) -> isize {
        let events = self.events.borrow();
        let created = events.iter().filter(|e| **e == Event::ContextCreate).count() as isize;
        let freed = events.iter().filter(|e| **e == Event::ContextFree).count() as isize;
        created - freed
    }
}

pub(crate) struct StubEngine {
    script: Script,
    probe: Rc<Probe>,
    backend: bool,
}

impl StubEngine {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            probe: Rc::new(Probe::default()),
            backend: false,
        }
    }

    pub fn probe(&self) -> Rc<Probe> {
        Rc::clone(&self.probe)
    }
}

pub(crate) struct StubModel {
    script: Script,
    probe: Rc<Probe>,
}

impl Drop for StubModel {
    fn drop(&mut self) {
        self.probe.record(Event::ModelFree);
    }
}

pub(crate) struct StubContext<'m> {
    model: &'m StubModel,
    decodes: usize,
    logits: Option<(usize, Vec<f32>)>,
}

impl Drop for StubContext<'_> {
    fn drop(&mut self) {
        self.model.probe.record(Event::ContextFree);
    }
}

impl InferenceEngine for StubEngine {
    type Model = StubModel;
    type Context<'m> = StubContext<'m>;

    fn init_backend(&mut self) -> Result<(), EngineError> {
        if !self.backend {
            self.backend = true;
            self.probe.record(Event::BackendInit);
        }
        Ok(())
    }

    fn free_backend(&mut self) {
        if self.backend {
            self.backend = false;
            self.probe.record(Event::BackendFree);
        }
    }

    fn load_model(&self, path: &Path, _params: &ModelParams) -> Result<StubModel, EngineError> {
        if !self.backend {
            return Err(EngineError::BackendNotInitialized);
        }
        if self.script.fail_load {
            return Err(EngineError::ModelLoad(format!("cannot read {}", path.display())));
        }
        self.probe.record(Event::ModelLoad);
        Ok(StubModel {
            script: self.script.clone(),
            probe: Rc::clone(&self.probe),
        })
    }

    fn new_context<'m>(
        &'m self,
        model: &'m StubModel,
        _params: &ContextParams,
    ) -> Result<StubContext<'m>, EngineError> {
        let created = self.probe.contexts_created.get();
        if self.script.fail_context_after.is_some_and(|limit| created >= limit) {
            return Err(EngineError::ContextCreate("out of memory".into()));
        }
        self.probe.contexts_created.set(created + 1);
        self.probe.record(Event::ContextCreate);
        Ok(StubContext {
            model,
            decodes: 0,
            logits: None,
        })
    }
}

impl Vocabulary for StubModel {
    fn tokenize(
        &self,
        text: &str,
        buf: &mut [Token],
        add_special: bool,
        _parse_special: bool,
    ) -> Result<i32, EngineError> {
        self.probe
            .tokenize_calls
            .set(self.probe.tokenize_calls.get() + 1);
        if self.script.panic_on_tokenize {
            panic!("tokenizer exploded");
        }

        let mut tokens = Vec::new();
        if add_special {
            tokens.push(BOS);
        }
        for b in text.bytes() {
            tokens.push(Token(b as i32));
            if self.script.doubled_tokens {
                tokens.push(Token(b as i32));
            }
        }

        if tokens.len() > buf.len() {
            return Ok(-(tokens.len() as i32));
        }
        buf[..tokens.len()].copy_from_slice(&tokens);
        Ok(tokens.len() as i32)
    }

    fn token_to_bytes(&self, token: Token, _special: bool) -> Result<Vec<u8>, EngineError> {
        match token.0 {
            id @ 0..=255 => Ok(vec![id as u8]),
            256 => Ok(b"</s>".to_vec()),
            257 => Ok(b"<s>".to_vec()),
            id => usize::try_from(id - FIRST_EXTRA)
                .ok()
                .and_then(|i| self.script.extra_pieces.get(i))
                .cloned()
                .ok_or(EngineError::Detokenize {
                    token: id,
                    reason: "unknown token".into(),
                }),
        }
    }

    fn is_end_of_generation(&self, token: Token) -> bool {
        token == EOG
    }

    fn vocab_size(&self) -> usize {
        FIRST_EXTRA as usize + self.script.extra_pieces.len()
    }
}

impl StubContext<'_> {
    fn scripted_token(&self, step: usize) -> Token {
        let script = &self.model.script;
        script
            .plan
            .get(step)
            .copied()
            .or(script.fallback)
            .unwrap_or(EOG)
    }
}

impl DecodeContext for StubContext<'_> {
    fn decode(&mut self, batch: &DecodeBatch) -> Result<(), EngineError> {
        let step = self.decodes;
        self.decodes += 1;
        self.model.probe.batches.borrow_mut().push(batch.clone());

        if self.model.script.fail_decode_at == Some(step) {
            self.logits = None;
            return Err(EngineError::Decode("scripted failure".into()));
        }
        if self.model.script.withhold_logits_at == Some(step) {
            self.logits = None;
            return Ok(());
        }

        let row = batch
            .entries()
            .iter()
            .rposition(|e| e.logits)
            .ok_or_else(|| EngineError::Decode("no logits requested".into()))?;

        let script = &self.model.script;
        let mut logits = vec![0.0; self.model.vocab_size()];
        if step >= script.plan.len() && !script.scores.is_empty() {
            for &(token, score) in &script.scores {
                if let Some(i) = token.index() {
                    logits[i] = score;
                }
            }
        } else if let Some(i) = self.scripted_token(step).index() {
            logits[i] = TARGET_LOGIT;
        }
        self.logits = Some((row, logits));
        Ok(())
    }

    fn logits(&self, row: usize) -> Option<&[f32]> {
        match &self.logits {
            Some((r, logits)) if *r == row => Some(logits.as_slice()),
            _ => None,
        }
    }
}
