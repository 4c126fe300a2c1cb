//! Pluggable message transformers (spam gates, translators, ...).
//!
//! The engine runs them in order before fan-out. None are implemented here.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::InboundMessage;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transform {
    /// Forward the message unchanged.
    Pass,
    /// Do not forward; the reason is logged.
    Drop(String),
    /// Send this text instead of forwarding the original.
    Rewrite(String),
}

#[async_trait]
pub trait MessageTransformer: Send + Sync {
    fn name(&self) -> &str;

    async fn transform(&self, msg: &InboundMessage) -> Transform;
}

/// What the engine should do after running the chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainOutcome {
    /// `text` is `Some` if any transformer rewrote the message.
    Forward { text: Option<String> },
    Dropped { by: String, reason: String },
}

/// Apply `chain` in order. Later transformers see earlier rewrites.
pub async fn apply_chain(
    chain: &[Arc<dyn MessageTransformer>],
    msg: &InboundMessage,
) -> ChainOutcome {
    let mut current = msg.clone();
    let mut rewritten = None;

    for t in chain {
        match t.transform(&current).await {
            Transform::Pass => {}
            Transform::Drop(reason) => {
                return ChainOutcome::Dropped {
                    by: t.name().to_string(),
                    reason,
                }
            }
            Transform::Rewrite(text) => {
                current.text = text.clone();
                rewritten = Some(text);
            }
        }
    }

    ChainOutcome::Forward { text: rewritten }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChatId, MessageId};

    struct Upper;

    #[async_trait]
    impl MessageTransformer for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        async fn transform(&self, msg: &InboundMessage) -> Transform {
            Transform::Rewrite(msg.text.to_uppercase())
        }
    }

    struct BlockWord(&'static str);

    #[async_trait]
    impl MessageTransformer for BlockWord {
        fn name(&self) -> &str {
            "block"
        }

        async fn transform(&self, msg: &InboundMessage) -> Transform {
            if msg.text.contains(self.0) {
                Transform::Drop(format!("contains {}", self.0))
            } else {
                Transform::Pass
            }
        }
    }

    fn msg(text: &str) -> InboundMessage {
        InboundMessage {
            source: ChatId(1),
            sender: None,
            message_id: MessageId(1),
            text: text.to_string(),
            media: None,
        }
    }

    #[tokio::test]
    async fn empty_chain_passes_original() {
        let out = apply_chain(&[], &msg("hi")).await;
        assert_eq!(out, ChainOutcome::Forward { text: None });
    }

    #[tokio::test]
    async fn later_transformers_see_rewrites() {
        let chain: Vec<Arc<dyn MessageTransformer>> =
            vec![Arc::new(Upper), Arc::new(BlockWord("SPAM"))];
        let out = apply_chain(&chain, &msg("cheap spam")).await;
        assert_eq!(
            out,
            ChainOutcome::Dropped {
                by: "block".to_string(),
                reason: "contains SPAM".to_string(),
            }
        );

        let out = apply_chain(&chain, &msg("hello")).await;
        assert_eq!(
            out,
            ChainOutcome::Forward {
                text: Some("HELLO".to_string())
            }
        );
    }
}
