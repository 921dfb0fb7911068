//! JSON-RPC 2.0 envelope carried inside oracle request and response events.

use serde::{Deserialize, Serialize};

use trustrelay_core::IdentityKey;

use crate::BusError;

/// Tool invoked on the oracle for batch score calculation.
pub const TRUST_SCORES_TOOL: &str = "calculate_trust_scores";

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u32,
    method: &'static str,
    params: ToolCallParams<'a>,
}

#[derive(Serialize)]
struct ToolCallParams<'a> {
    name: &'static str,
    arguments: TrustScoreArguments<'a>,
}

#[derive(Serialize)]
struct TrustScoreArguments<'a> {
    #[serde(rename = "targetPubkeys")]
    target_pubkeys: &'a [IdentityKey],
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: RpcResult,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize, Default)]
struct RpcResult {
    #[serde(rename = "structuredContent", default)]
    structured_content: StructuredContent,
    #[serde(rename = "isError", default)]
    is_error: bool,
}

#[derive(Deserialize, Default)]
struct StructuredContent {
    #[serde(rename = "trustScores", default)]
    trust_scores: Vec<TrustScoreEntry>,
}

#[derive(Deserialize)]
struct TrustScoreEntry {
    #[serde(rename = "targetPubkey")]
    target_pubkey: IdentityKey,
    score: f64,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    #[allow(dead_code)]
    #[serde(default)]
    code: i64,
    message: String,
}

/// Score reported for one identity key.
#[derive(Clone, Debug, PartialEq)]
pub struct PubScore {
    pub pubkey: IdentityKey,
    pub score: f64,
}

/// Builds the request payload for a batch of target keys.
///
/// The JSON-RPC id is a constant; correlation happens through the carrying
/// event's id tag, never through this field.
pub fn encode_request(targets: &[IdentityKey]) -> Result<String, BusError> {
    let request = RpcRequest {
        jsonrpc: "2.0",
        id: 1,
        method: "tools/call",
        params: ToolCallParams {
            name: TRUST_SCORES_TOOL,
            arguments: TrustScoreArguments {
                target_pubkeys: targets,
            },
        },
    };
    serde_json::to_string(&request).map_err(|e| BusError::Parse(e.to_string()))
}

/// Parses a response payload into per-key scores.
///
/// An `error` object or `result.isError` both count as oracle failure.
pub fn parse_response(content: &str) -> Result<Vec<PubScore>, BusError> {
    let response: RpcResponse =
        serde_json::from_str(content).map_err(|e| BusError::Parse(e.to_string()))?;

    if let Some(error) = response.error {
        return Err(BusError::Rpc(error.message));
    }
    if response.result.is_error {
        return Err(BusError::Rpc("tool execution error".into()));
    }

    Ok(response
        .result
        .structured_content
        .trust_scores
        .into_iter()
        .map(|entry| PubScore {
            pubkey: entry.target_pubkey,
            score: entry.score,
        })
        .collect())
}
