//! LLM-driven summarization: topic labels, subjects, per-subject summaries,
//! recap, action items, and the assembled long-summary markdown.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use reflector_core::ActionItems;
use reflector_llm::{LanguageModel, LlmError};

pub const TOPIC_PROMPT: &str = "\
You are given an excerpt of a meeting transcript. Produce a short topic \
title and a two or three sentence summary of what was discussed in it. \
The title must be concise, headline style, without quotes.";

pub const TITLE_PROMPT: &str = "\
Given the list of topics discussed in a meeting, produce a single short \
title for the whole meeting. Do not use quotes, do not mention that it is \
a meeting.";

pub const SUBJECTS_PROMPT: &str = "\
What are the main / high level topics of the meeting. \
Do not include direct quotes or unnecessary details. \
Be concise and focused on the main ideas. \
A subject briefly mentioned should not be included. \
There should be maximum 6 subjects. \
Do not write complete narrative sentences for the subject, \
you must write a concise subject using noun phrases.";

pub const DETAILED_SUBJECT_PROMPT: &str = "\
Get me information about the topic \"{subject}\". \
Highlight important arguments, insights, or data presented. \
Outline decisions made, including any rationale or key factors that \
influenced them. Detail action items and responsibilities, with deadlines \
when mentioned. Mention unresolved issues or topics needing further \
discussion. Do not include topics unrelated to \"{subject}\".";

pub const PARAGRAPH_SUMMARY_PROMPT: &str = "\
Summarize the mentioned topic in 1 paragraph. \
It will be integrated into the final summary, so just for this topic.";

pub const RECAP_PROMPT: &str = "\
Provide a high-level quick recap of the following meeting, fitting in one \
paragraph. Do not include decisions, action items or unresolved issues, \
just highlight the high moments. Just dive into the meeting, be concise \
and do not include unnecessary details. As we already know it is a \
meeting, do not start with 'During the meeting' or equivalent.";

pub const ACTION_ITEMS_PROMPT: &str = "\
Identify the decisions made in this meeting and the concrete next steps \
agreed upon. Decisions are conclusions that were reached; next steps are \
actions someone committed to take. Leave a list empty when the meeting \
contains none.";

pub fn topic_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "title": {"type": "string"},
            "summary": {"type": "string"},
        },
        "required": ["title", "summary"],
    })
}

pub fn subjects_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "subjects": {
                "type": "array",
                "items": {"type": "string"},
                "maxItems": 6,
            },
        },
        "required": ["subjects"],
    })
}

pub fn action_items_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "decisions": {"type": "array", "items": {"type": "string"}},
            "next_steps": {"type": "array", "items": {"type": "string"}},
        },
        "required": ["decisions", "next_steps"],
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubjectSummary {
    pub subject: String,
    pub summary: String,
}

/// Drives the subject → summaries → recap sequence over a speaker-labelled
/// transcript text.
pub struct SummaryBuilder<'a> {
    llm: &'a dyn LanguageModel,
    transcript_text: String,
    participant_names: Vec<String>,
}

impl<'a> SummaryBuilder<'a> {
    pub fn new(llm: &'a dyn LanguageModel, transcript_text: impl Into<String>) -> Self {
        Self {
            llm,
            transcript_text: transcript_text.into(),
            participant_names: Vec::new(),
        }
    }

    pub fn with_participants(mut self, names: Vec<String>) -> Self {
        self.participant_names = names;
        self
    }

    fn participant_instructions(&self) -> Option<String> {
        if self.participant_names.is_empty() {
            return None;
        }
        Some(format!(
            "The known participants are: {}. Use these exact names when \
             referring to speakers.",
            self.participant_names.join(", ")
        ))
    }

    fn prompt_with_participants(&self, prompt: &str) -> String {
        match self.participant_instructions() {
            Some(instructions) => format!("{prompt}\n\n{instructions}"),
            None => prompt.to_string(),
        }
    }

    pub async fn extract_subjects(&self) -> Result<Vec<String>, LlmError> {
        let value = self
            .llm
            .complete_structured(
                &self.prompt_with_participants(SUBJECTS_PROMPT),
                &[self.transcript_text.clone()],
                &subjects_schema(),
            )
            .await?;
        #[derive(Deserialize)]
        struct Subjects {
            subjects: Vec<String>,
        }
        let parsed: Subjects = serde_json::from_value(value)
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        Ok(parsed.subjects)
    }

    /// Two calls per subject, as the sources do it: a detailed breakdown
    /// over the transcript, then a one-paragraph compression of that
    /// breakdown.
    pub async fn summarize_subject(&self, subject: &str) -> Result<SubjectSummary, LlmError> {
        let detailed_prompt = self
            .prompt_with_participants(&DETAILED_SUBJECT_PROMPT.replace("{subject}", subject));
        let detailed = self
            .llm
            .complete(&detailed_prompt, &[self.transcript_text.clone()])
            .await?;
        let paragraph = self
            .llm
            .complete(PARAGRAPH_SUMMARY_PROMPT, &[detailed])
            .await?;
        Ok(SubjectSummary {
            subject: subject.to_string(),
            summary: paragraph,
        })
    }

    pub async fn generate_recap(&self, summaries: &[SubjectSummary]) -> Result<String, LlmError> {
        let summaries_text = summaries
            .iter()
            .map(|s| format!("{}: {}", s.subject, s.summary))
            .collect::<Vec<_>>()
            .join("\n\n");
        self.llm
            .complete(&self.prompt_with_participants(RECAP_PROMPT), &[summaries_text])
            .await
    }

    pub async fn identify_action_items(&self) -> Result<ActionItems, LlmError> {
        let value = self
            .llm
            .complete_structured(
                &self.prompt_with_participants(ACTION_ITEMS_PROMPT),
                &[self.transcript_text.clone()],
                &action_items_schema(),
            )
            .await?;
        serde_json::from_value(value).map_err(|e| LlmError::InvalidResponse(e.to_string()))
    }
}

/// `# Quick recap` + `# Summary` markdown, one bolded subject per paragraph.
pub fn build_summary_markdown(recap: &str, summaries: &[SubjectSummary]) -> String {
    let mut lines: Vec<String> = Vec::new();
    if !recap.is_empty() {
        lines.push("# Quick recap".to_string());
        lines.push(String::new());
        lines.push(recap.to_string());
        lines.push(String::new());
    }
    if !summaries.is_empty() {
        lines.push("# Summary".to_string());
        lines.push(String::new());
        for summary in summaries {
            lines.push(format!("**{}**", summary.subject));
            lines.push(summary.summary.clone());
            lines.push(String::new());
        }
    }
    lines.join("\n")
}

pub async fn generate_title(
    llm: &dyn LanguageModel,
    topics: &[(String, String)],
) -> Result<String, LlmError> {
    let topic_lines = topics
        .iter()
        .map(|(title, summary)| format!("{title}: {summary}"))
        .collect::<Vec<_>>()
        .join("\n");
    let title = llm.complete(TITLE_PROMPT, &[topic_lines]).await?;
    Ok(title.trim().trim_matches('"').to_string())
}

/// Words that stay lower-case in a headline-style title.
const TITLE_STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "nor", "for", "yet", "so", "at", "by", "in", "of", "on",
    "to", "up", "as", "is", "via", "per", "vs",
];

static OPEN_BRACKET_SPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([\[\{\(])\s+").expect("static regex"));
static CLOSE_BRACKET_SPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+([\]\}\)])").expect("static regex"));

/// The LLM takes care of word casing, but in rare cases this falters. Fix up
/// lower-cased content words (first token always counts) and tighten spaces
/// inside brackets; nothing else changes.
pub fn ensure_casing(title: &str) -> String {
    let cased = title
        .split_whitespace()
        .enumerate()
        .map(|(i, word)| {
            let is_stopword = TITLE_STOPWORDS.contains(&word.to_lowercase().as_str());
            let starts_lower = word.chars().next().is_some_and(|c| c.is_lowercase());
            if starts_lower && (i == 0 || !is_stopword) {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => word.to_string(),
                }
            } else {
                word.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    let cased = OPEN_BRACKET_SPACE.replace_all(&cased, "$1");
    CLOSE_BRACKET_SPACE.replace_all(&cased, "$1").into_owned()
}
