// src/decoder.rs

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const UNKNOWN_OP: &str = "unknown";

/// One raw instruction handed to the decoder, opaque to this crate.
#[derive(Debug, Clone, Serialize)]
pub struct RawInstruction {
    pub signature: String,
    pub program_id: Option<String>,
    pub data: serde_json::Value,
}

/// What the decoder says an instruction was.
#[derive(Debug, Clone, Deserialize)]
pub struct DecodedOp {
    pub signature: String,
    pub operation: String,
}

/// Opaque batch decoder: an optional external command fed one JSON array on
/// stdin, answering with one JSON array of `{signature, operation}` on
/// stdout. When no command is configured (or the command misbehaves) every
/// instruction decodes to "unknown" — decoding quality is not this crate's
/// concern.
#[derive(Debug, Clone, Default)]
pub struct DecoderHandle {
    command: Option<String>,
}

impl DecoderHandle {
    pub fn new(command: Option<String>) -> Self {
        Self { command }
    }

    pub async fn decode_batch(&self, instructions: &[RawInstruction]) -> Vec<DecodedOp> {
        if instructions.is_empty() {
            return Vec::new();
        }
        let Some(command) = &self.command else {
            return Self::unknown_batch(instructions);
        };
        match self.run_decoder(command, instructions).await {
            Ok(ops) => ops,
            Err(e) => {
                warn!("decoder command failed, labeling batch unknown: {}", e);
                Self::unknown_batch(instructions)
            }
        }
    }

    async fn run_decoder(
        &self,
        command: &str,
        instructions: &[RawInstruction],
    ) -> Result<Vec<DecodedOp>> {
        let mut parts = command.split_whitespace();
        let program = parts.next().context("empty decoder command")?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning decoder {}", program))?;

        let payload = serde_json::to_vec(instructions)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            anyhow::bail!("decoder exited with {}", output.status);
        }

        let ops: Vec<DecodedOp> = serde_json::from_slice(&output.stdout)
            .context("parsing decoder output")?;
        debug!("decoder labeled {} instructions", ops.len());
        Ok(ops)
    }

    fn unknown_batch(instructions: &[RawInstruction]) -> Vec<DecodedOp> {
        instructions
            .iter()
            .map(|ix| DecodedOp {
                signature: ix.signature.clone(),
                operation: UNKNOWN_OP.to_string(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instruction(signature: &str) -> RawInstruction {
        RawInstruction {
            signature: signature.to_string(),
            program_id: None,
            data: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn unconfigured_decoder_labels_everything_unknown() {
        let decoder = DecoderHandle::new(None);
        let ops = decoder
            .decode_batch(&[instruction("a"), instruction("b")])
            .await;
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| op.operation == "unknown"));
    }

    #[tokio::test]
    async fn broken_command_falls_back_to_unknown() {
        let decoder = DecoderHandle::new(Some("/nonexistent/decoder-bin".to_string()));
        let ops = decoder.decode_batch(&[instruction("a")]).await;
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].operation, "unknown");
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop() {
        let decoder = DecoderHandle::new(None);
        assert!(decoder.decode_batch(&[]).await.is_empty());
    }
}
