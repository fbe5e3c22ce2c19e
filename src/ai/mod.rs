//! Generative model client backing re-evaluation and ad-hoc dossiers.

mod client;
mod prompts;

pub use client::*;
pub use prompts::{
    format_dossier_request, format_reevaluation_request, DOSSIER_SYSTEM_PROMPT,
    REEVALUATION_SYSTEM_PROMPT,
};
