//! Recent-token window used by the repetition penalty

use std::collections::VecDeque;

use crate::engine::Token;

/// Fixed-capacity FIFO of the most recently seen tokens, oldest first.
#[derive(Debug, Clone)]
pub struct TokenHistory {
    tokens: VecDeque<Token>,
    capacity: usize,
}

impl TokenHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            tokens: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends `token`, evicting the oldest entry once full.
    pub fn push(&mut self, token: Token) {
        if self.capacity == 0 {
            return;
        }
        if self.tokens.len() == self.capacity {
            self.tokens.pop_front();
        }
        self.tokens.push_back(token);
    }

    pub fn iter(&self) -> impl Iterator<Item = Token> + '_ {
        self.tokens.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Extend<Token> for TokenHistory {
    fn extend<I: IntoIterator<Item = Token>>(&mut self, iter: I) {
        for token in iter {
            self.push(token);
        }
    }
}
