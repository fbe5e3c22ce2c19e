//! Prompts for re-evaluation and ad-hoc dossiers.

use crate::knowledge::{AnalysisView, Delta, FieldValue, KnowledgeRecord};

/// Longest JSON excerpt of prior recommendations included in a prompt.
const MAX_CONTEXT_CHARS: usize = 3000;

const RECOMMENDATION_SHAPE: &str = r#"{
  "businessType": string,
  "category": "F&B"|"Retail"|"Wellness"|"Education"|"Services"|"Other",
  "opportunityScore": number (0-100),
  "thesis": string,
  "gapReason": string,
  "estimatedRental": number,
  "suggestedLocations": [string],
  "businessProfile": {"size": string, "targetAudience": string, "strategy": string, "employees": string},
  "financials": {"upfrontCost": number, "monthlyCost": number, "monthlyRevenueBad": number, "monthlyRevenueAvg": number, "monthlyRevenueGood": number},
  "dataSourceUrl": string
}"#;

/// System prompt for the re-evaluation stage.
pub const REEVALUATION_SYSTEM_PROMPT: &str = r#"You are a strategic investment advisor for residential town centres.
You are called ONLY when significant changes have been detected in an area.

Given the current knowledge of the area and the changes detected:
1. Review existing recommendations against the changes
2. Adjust opportunity scores if warranted
3. Add new recommendations if new opportunities emerged
4. Keep recommendations that are still valid
5. Provide EXACTLY 3 recommendations

Return ONLY a JSON object, no markdown fences:
{"summary": string, "recommendations": [recommendation, recommendation, recommendation]}
"#;

/// System prompt for ad-hoc dossiers.
pub const DOSSIER_SYSTEM_PROMPT: &str =
    "You are a business feasibility analyst. Return ONLY valid JSON, no markdown fences.";

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((i, _)) => &text[..i],
        None => text,
    }
}

fn value_or_na(view: &AnalysisView, key: &str) -> String {
    view.values
        .get(key)
        .map_or_else(|| "N/A".to_string(), FieldValue::display)
}

/// User message for a re-evaluation.
#[must_use]
pub fn format_reevaluation_request(record: &KnowledgeRecord, high: &[Delta]) -> String {
    let known: Vec<String> = record
        .categories
        .iter()
        .map(|(name, entry)| {
            format!(
                "- {name}: {} (confidence {:.2})",
                entry.value.display(),
                entry.confidence
            )
        })
        .collect();
    let changes: Vec<String> = high.iter().map(|d| format!("- {}", d.change)).collect();
    let current = record
        .evaluation
        .as_ref()
        .map(|e| serde_json::to_string_pretty(&e.recommendations).unwrap_or_default())
        .unwrap_or_else(|| "[]".to_string());

    format!(
        "Area: {entity}\n\nCURRENT KNOWLEDGE:\n{known}\n\nSIGNIFICANT CHANGES DETECTED:\n{changes}\n\n\
         CURRENT RECOMMENDATIONS:\n{current}\n\nEach recommendation has this shape:\n{shape}\n\n\
         Please provide updated recommendations reflecting these changes.",
        entity = record.entity,
        known = known.join("\n"),
        changes = changes.join("\n"),
        current = truncate(&current, MAX_CONTEXT_CHARS),
        shape = RECOMMENDATION_SHAPE,
    )
}

/// User message for a dossier on a custom topic.
#[must_use]
pub fn format_dossier_request(view: &AnalysisView, topic: &str) -> String {
    format!(
        "Generate a SINGLE strategic investment dossier for a \"{topic}\" in \"{entity}\".\n\n\
         CONTEXT:\n- Wealth Tier: {tier}\n- Median Income: {income}\n- Population: {population}\n\n\
         REQUIREMENTS:\n- Create a realistic business plan\n- Provide financials in local currency\n\
         - Classify correctly (F&B, Retail, Wellness, Education, Services, Other)\n\
         - Provide a dataSourceUrl for a relevant benchmark\n\n\
         Return ONLY a single JSON object with this structure:\n{shape}",
        entity = view.entity,
        tier = value_or_na(view, "wealthTier"),
        income = value_or_na(view, "medianIncome"),
        population = value_or_na(view, "residentPopulation"),
        shape = RECOMMENDATION_SHAPE,
    )
}
