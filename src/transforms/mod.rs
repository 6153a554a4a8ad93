//! Protocol translation between the client-facing surfaces and the upstream
//! families.
//!
//! - `claude_gemini`: Claude-Messages ⇄ Gemini generateContent bodies
//! - `gemini_stream`: Gemini SSE → Claude SSE with delta reconciliation
//! - `claude_stream`: Claude SSE passthrough with usage capture

pub mod claude_gemini;
pub mod claude_stream;
pub mod gemini_stream;

pub use claude_gemini::{claude_to_gemini_request, gemini_to_claude_response, sanitize_schema};
pub use claude_stream::{claude_sse_passthrough, gemini_sse_passthrough, openai_sse_passthrough};
pub use gemini_stream::{GeminiStreamTranslator, gemini_sse_to_claude_sse};
