//! Validator: protected-content integrity check and token savings.

use async_trait::async_trait;
use ctxgate_core::token::estimate_messages_tokens;
use ctxgate_core::{Error, Message, Result};
use tracing::{debug, error};

use crate::stage::{RequestContext, Stage};

#[derive(Debug, Clone, Copy, Default)]
pub struct Validator;

/// Savings between two message lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Savings {
    pub before: usize,
    pub after: usize,
    pub saved: usize,
}

impl Validator {
    pub fn new() -> Self {
        Self
    }

    /// Every protected input message must appear in `output`, unmodified
    /// and in the same relative order.
    pub fn check_integrity(&self, input: &[Message], output: &[Message]) -> Result<()> {
        let mut remaining = output.iter();
        for (idx, protected) in input.iter().enumerate().filter(|(_, m)| m.protected) {
            if !remaining.any(|m| m == protected) {
                return Err(Error::IntegrityViolation(format!(
                    "protected message {idx} ({}) altered, dropped, or reordered",
                    protected.role
                )));
            }
        }
        Ok(())
    }

    pub fn savings(&self, input: &[Message], output: &[Message]) -> Savings {
        let before = estimate_messages_tokens(input);
        let after = estimate_messages_tokens(output);
        Savings {
            before,
            after,
            saved: before.saturating_sub(after),
        }
    }
}

#[async_trait]
impl Stage for Validator {
    fn name(&self) -> &'static str {
        "validator"
    }

    async fn run(&self, mut ctx: RequestContext) -> Result<RequestContext> {
        if let Err(e) = self.check_integrity(&ctx.original, &ctx.messages) {
            error!(request_id = %ctx.request_id, error = %e, "Integrity check failed");
            return Err(e);
        }
        let savings = self.savings(&ctx.original, &ctx.messages);
        ctx.tokens_before = savings.before;
        ctx.tokens_after = savings.after;
        ctx.tokens_saved = savings.saved;
        debug!(
            request_id = %ctx.request_id,
            before = savings.before,
            after = savings.after,
            saved = savings.saved,
            "Request validated"
        );
        Ok(ctx)
    }
}
