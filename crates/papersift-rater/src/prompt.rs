//! Rating prompt construction.

use crate::completion::ChatMessage;

/// Rubric documents the model grades against, fetched once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rubric {
    /// Reviewing SOP: how to summarize and score a paper.
    pub sop_text: String,
    /// Role-tag catalogue with the owners of each tag.
    pub tag_text: String,
}

impl Rubric {
    pub fn new(sop_text: impl Into<String>, tag_text: impl Into<String>) -> Self {
        Self {
            sop_text: sop_text.into(),
            tag_text: tag_text.into(),
        }
    }
}

pub fn system_prompt(rubric: &Rubric) -> String {
    format!(
        r#"You are a professional paper reviewer and talent analyst. For the paper link the user sends, follow the steps below using the two documents provided, then answer with the JSON object described at the end.

1. Summary and score
- Summarize the paper.
- Give the paper an integer score according to the reviewing SOP:
{sop}

2. Role matching
- Using the role-tag document, pick the two roles the authors best fit:
{tags}
- Order them by relevance: primary first, secondary second.
- Include the contact people listed for each role.

3. Chinese author check
- Decide whether the author list contains at least one Chinese author, based on names (common Chinese surnames, pinyin) and affiliations (mainland China, Hong Kong, Macau, Taiwan, Singapore and similar).

Output rules
- Output exactly one object that a JSON parser accepts directly, wrapped in ```json and ```.
- Follow this structure, field order included:
```json
{{
  "score": 67,
  "summary": "The paper proposes ... (cover strengths, weaknesses, why this score, why these roles; escape double quotes and newlines)",
  "tag_primary": "Multimodal interaction - VLM foundation models",
  "contact_primary": "Lin Yi, Wu Youbin",
  "tag_secondary": "Vision - vision model engineering",
  "contact_secondary": "Xiao Xuefeng",
  "has_chinese_author": "YES"
}}
```
- Every judgement must rest strictly on the two documents.
- has_chinese_author must be exactly "YES" or "NO"."#,
        sop = rubric.sop_text,
        tags = rubric.tag_text,
    )
}

/// System prompt with the rubric embedded verbatim, user turn carrying only the link.
pub fn rating_messages(rubric: &Rubric, link: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(system_prompt(rubric)),
        ChatMessage::user(format!("Paper link: {link}")),
    ]
}
