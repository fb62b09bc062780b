//! Intent routing
//!
//! Each turn resolves to exactly one [`Intent`]. Keyword rules decide first;
//! when they are inconclusive an optional language model is asked. Calendar
//! and email intents trigger external actions, so they are only accepted on a
//! clear signal: a model vote for either needs a matching cue in the user's
//! own words. Everything unresolved becomes [`Intent::KnowledgeQuery`].

use crate::agent::conversation::AugmentedQuery;
use crate::agent::llm::{GenerationParams, LanguageModel, Prompt, complete_with_timeout};
use chrono::{Datelike, Duration as ChronoDuration, Local, NaiveDate, Weekday};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Purpose of a user turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    KnowledgeQuery,
    CalendarQuery,
    EmailDraft,
    Other,
}

impl Intent {
    pub const ALL: [Intent; 4] = [
        Intent::KnowledgeQuery,
        Intent::CalendarQuery,
        Intent::EmailDraft,
        Intent::Other,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Intent::KnowledgeQuery => "KNOWLEDGE_QUERY",
            Intent::CalendarQuery => "CALENDAR_QUERY",
            Intent::EmailDraft => "EMAIL_DRAFT",
            Intent::Other => "OTHER",
        }
    }

    /// Calendar lookups and email drafts reach outside the knowledge base
    pub fn is_side_effecting(&self) -> bool {
        matches!(self, Intent::CalendarQuery | Intent::EmailDraft)
    }

    /// First intent label mentioned in free model output
    pub fn from_model_output(text: &str) -> Option<Self> {
        let upper = text.to_uppercase();
        Self::ALL
            .iter()
            .filter_map(|intent| upper.find(intent.label()).map(|pos| (pos, *intent)))
            .min_by_key(|(pos, _)| *pos)
            .map(|(_, intent)| intent)
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Inclusive range of calendar days
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn single(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start.format("%A, %B %-d, %Y"))
        } else {
            write!(
                f,
                "{} to {}",
                self.start.format("%a %b %-d"),
                self.end.format("%a %b %-d, %Y")
            )
        }
    }
}

/// Slot values pulled out of the question
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentSlots {
    pub recipient: Option<String>,
    pub subject_hint: Option<String>,
    pub date_range: Option<DateRange>,
}

/// What decided the intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Rules,
    Model,
    Default,
}

/// Result of classifying one turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentClassification {
    pub intent: Intent,
    pub slots: IntentSlots,
    pub source: ClassificationSource,
}

struct Rules {
    email_request: Regex,
    email_cue: Regex,
    calendar_strong: Vec<Regex>,
    calendar_cue: Regex,
    small_talk: Regex,
    question: Regex,
    email_address: Regex,
    recipient_name: Regex,
    subject: Regex,
    iso_date: Regex,
}

fn rules() -> &'static Rules {
    static RULES: OnceLock<Rules> = OnceLock::new();
    RULES.get_or_init(|| {
        let re = |pattern: &str| Regex::new(pattern).expect("static regex");
        Rules {
            // imperative requests only: "draft an email ...", "can you write a mail ..."
            email_request: re(
                r"(?i)^\s*(?:(?:please|kindly)\s+|(?:can|could|would|will)\s+you\s+(?:please\s+)?|i(?:\s+(?:need|want|would\s+like)|'d\s+like)\s+(?:you\s+)?to\s+|help\s+me\s+)?(?:draft|write|compose|send|prepare)\b[^.?!]{0,40}\b(?:e-?mail|mail|message)\b|(?i)^\s*e-?mail\s+\S+\s+(?:about|regarding)\b",
            ),
            email_cue: re(r"(?i)\b(e-?mail|mail|inbox|draft)\b"),
            // a first-person subject tied to a calendar noun or a time
            calendar_strong: vec![
                re(r"(?i)\bmy\s+(calendar|schedule|agenda|diary)\b"),
                re(r"(?i)\bour\s+(team\s+)?calendar\b"),
                re(r"(?i)\bmy\s+(next\s+|first\s+|last\s+)?(meetings?|appointments?|calls?)\b"),
                re(r"(?i)\b(do|did)\s+(i|we)\s+have\s+(?:any\s+|an?\s+|other\s+)?(?:\w+\s+)?(meetings?|appointments?|calls?)\b"),
                re(r"(?i)\b(meetings?|appointments?|calls?)\s+(do|did|have)\s+(i|we)\b"),
                re(r"(?i)\b(am|are)\s+(i|we)\s+(free|busy|available)\s+(today|tonight|tomorrow|this week|next week|this weekend|on\s+\w+|at\s+\d|monday|tuesday|wednesday|thursday|friday|saturday|sunday|\d{4}-\d{2}-\d{2})\b"),
            ],
            calendar_cue: re(
                r"(?i)\b(calendar|schedule|agenda|meetings?|appointments?|events?|free|busy|today|tomorrow|yesterday|this week|next week|monday|tuesday|wednesday|thursday|friday|saturday|sunday)\b",
            ),
            small_talk: re(
                r"(?i)^\s*(hi|hello|hey|yo|thanks|thank you|thx|cheers|bye|goodbye|good (morning|afternoon|evening|night)|ok|okay|great|cool)( there| so much| a lot| again)?[\s!.,:)]*$",
            ),
            question: re(
                r"(?i)^\s*(what|what's|whats|how|who|whom|when|where|which|why|is|are|do|does|did|can|could|should|will|would|list|explain|describe|summari[sz]e)\b",
            ),
            email_address: re(r"[\w.+-]+@[\w-]+(?:\.[\w-]+)+"),
            recipient_name: re(
                r"\b(?:[Tt]o|[Ee]-?mail)\s+([A-Z][a-zA-Z'-]+(?:\s+[A-Z][a-zA-Z'-]+)?)",
            ),
            subject: re(r"(?i)\b(?:about|regarding|concerning|re:)\s+(.+?)[\s.?!]*$"),
            iso_date: re(r"\b(\d{4})-(\d{2})-(\d{2})\b"),
        }
    })
}

fn weekday_from_name(name: &str) -> Option<Weekday> {
    match name {
        "monday" => Some(Weekday::Mon),
        "tuesday" => Some(Weekday::Tue),
        "wednesday" => Some(Weekday::Wed),
        "thursday" => Some(Weekday::Thu),
        "friday" => Some(Weekday::Fri),
        "saturday" => Some(Weekday::Sat),
        "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

fn week_of(day: NaiveDate) -> DateRange {
    let monday = day - ChronoDuration::days(day.weekday().num_days_from_monday() as i64);
    DateRange {
        start: monday,
        end: monday + ChronoDuration::days(6),
    }
}

/// Date range named in `text`, relative to `today`
pub fn extract_date_range(text: &str, today: NaiveDate) -> Option<DateRange> {
    let rules = rules();
    if let Some(caps) = rules.iso_date.captures(text) {
        let parsed = NaiveDate::from_ymd_opt(
            caps[1].parse().ok()?,
            caps[2].parse().ok()?,
            caps[3].parse().ok()?,
        );
        if let Some(day) = parsed {
            return Some(DateRange::single(day));
        }
    }

    let lower = text.to_lowercase();
    // before the week checks: "this weekend" contains "this week"
    if lower.contains("weekend") {
        let ahead = (Weekday::Sat.num_days_from_monday() as i64
            - today.weekday().num_days_from_monday() as i64)
            .rem_euclid(7);
        let saturday = if today.weekday() == Weekday::Sun {
            today - ChronoDuration::days(1)
        } else {
            today + ChronoDuration::days(ahead)
        };
        return Some(DateRange {
            start: saturday,
            end: saturday + ChronoDuration::days(1),
        });
    }
    if lower.contains("next week") {
        return Some(week_of(today + ChronoDuration::days(7)));
    }
    if lower.contains("this week") {
        return Some(week_of(today));
    }
    if lower.contains("tomorrow") {
        return Some(DateRange::single(today + ChronoDuration::days(1)));
    }
    if lower.contains("yesterday") {
        return Some(DateRange::single(today - ChronoDuration::days(1)));
    }
    if lower.contains("today") || lower.contains("tonight") {
        return Some(DateRange::single(today));
    }

    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    for (i, word) in words.iter().enumerate() {
        if let Some(target) = weekday_from_name(word) {
            let mut ahead = (target.num_days_from_monday() as i64
                - today.weekday().num_days_from_monday() as i64)
                .rem_euclid(7);
            if ahead == 0 && i > 0 && words[i - 1] == "next" {
                ahead = 7;
            }
            return Some(DateRange::single(today + ChronoDuration::days(ahead)));
        }
    }
    None
}

/// Recipient (address or capitalized name) and subject hint of an email request
pub fn extract_email_slots(text: &str) -> (Option<String>, Option<String>) {
    let rules = rules();
    let recipient = rules
        .email_address
        .find(text)
        .map(|m| m.as_str().to_string())
        .or_else(|| {
            rules
                .recipient_name
                .captures(text)
                .map(|c| c[1].to_string())
        });
    let subject = rules
        .subject
        .captures(text)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty());
    (recipient, subject)
}

enum RuleVerdict {
    Decided(Intent),
    Inconclusive,
}

fn apply_rules(text: &str) -> RuleVerdict {
    let rules = rules();
    if rules.email_request.is_match(text) {
        return RuleVerdict::Decided(Intent::EmailDraft);
    }
    if rules.calendar_strong.iter().any(|r| r.is_match(text)) {
        return RuleVerdict::Decided(Intent::CalendarQuery);
    }
    if rules.small_talk.is_match(text) {
        return RuleVerdict::Decided(Intent::Other);
    }
    if rules.question.is_match(text) || text.trim_end().ends_with('?') {
        return RuleVerdict::Decided(Intent::KnowledgeQuery);
    }
    RuleVerdict::Inconclusive
}

/// Whether the user's own words carry a cue for a side-effecting intent
fn has_cue(intent: Intent, text: &str) -> bool {
    let rules = rules();
    match intent {
        Intent::EmailDraft => rules.email_cue.is_match(text),
        Intent::CalendarQuery => rules.calendar_cue.is_match(text),
        Intent::KnowledgeQuery | Intent::Other => true,
    }
}

const CLASSIFIER_SYSTEM_PROMPT: &str = "You classify messages sent to a company assistant. \
Answer with exactly one label and nothing else:\n\
KNOWLEDGE_QUERY - a question about company documents, policies or facts\n\
CALENDAR_QUERY - a question about the user's calendar, meetings or availability\n\
EMAIL_DRAFT - a request to write or draft an email\n\
OTHER - greetings, thanks or small talk";

/// Rule-first intent classifier with optional model fallback
pub struct IntentRouter {
    model: Option<Arc<dyn LanguageModel>>,
    timeout: Duration,
}

impl IntentRouter {
    /// Rules only
    pub fn rules_only() -> Self {
        Self {
            model: None,
            timeout: Duration::from_secs(10),
        }
    }

    /// Rules, then `model` for inconclusive input
    pub fn with_model(model: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        Self {
            model: Some(model),
            timeout,
        }
    }

    /// Classify against the system clock's date
    pub async fn classify(&self, query: &AugmentedQuery) -> IntentClassification {
        self.classify_on(query, Local::now().date_naive()).await
    }

    /// Classify with an explicit "today" for relative dates
    ///
    /// Rules read only what the user typed; the folded-in history is shown to
    /// the model fallback as context.
    pub async fn classify_on(&self, query: &AugmentedQuery, today: NaiveDate) -> IntentClassification {
        let text = query.original.as_str();
        let (intent, source) = match apply_rules(text) {
            RuleVerdict::Decided(intent) => (intent, ClassificationSource::Rules),
            RuleVerdict::Inconclusive => match self.ask_model(query).await {
                Some(intent) if has_cue(intent, text) => (intent, ClassificationSource::Model),
                Some(intent) => {
                    log::debug!(
                        "Model suggested {} without a matching cue, defaulting to knowledge query",
                        intent
                    );
                    (Intent::KnowledgeQuery, ClassificationSource::Default)
                }
                None => (Intent::KnowledgeQuery, ClassificationSource::Default),
            },
        };

        let slots = match intent {
            Intent::EmailDraft => {
                let (recipient, subject_hint) = extract_email_slots(text);
                IntentSlots {
                    recipient,
                    subject_hint,
                    date_range: None,
                }
            }
            Intent::CalendarQuery => IntentSlots {
                date_range: Some(
                    extract_date_range(text, today).unwrap_or_else(|| DateRange::single(today)),
                ),
                ..Default::default()
            },
            Intent::KnowledgeQuery | Intent::Other => IntentSlots::default(),
        };

        log::debug!("Classified '{}' as {} ({:?})", text, intent, source);
        IntentClassification {
            intent,
            slots,
            source,
        }
    }

    async fn ask_model(&self, query: &AugmentedQuery) -> Option<Intent> {
        let model = self.model.as_ref()?;
        let prompt = Prompt::new(CLASSIFIER_SYSTEM_PROMPT, format!("Message: {}", query.text));
        let params = GenerationParams {
            max_tokens: 10,
            temperature: 0.0,
        };
        match complete_with_timeout(model.as_ref(), &prompt, &params, self.timeout).await {
            Ok(output) => {
                let intent = Intent::from_model_output(&output);
                if intent.is_none() {
                    log::warn!("Unrecognised intent label from model: {:?}", output);
                }
                intent
            }
            Err(e) => {
                log::warn!("Intent model fallback failed: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AgentError, Result};
    use async_trait::async_trait;

    struct FixedModel(&'static str);

    #[async_trait]
    impl LanguageModel for FixedModel {
        async fn complete(&self, _prompt: &Prompt, _params: &GenerationParams) -> Result<String> {
            Ok(self.0.to_string())
        }

        async fn health_check(&self) -> Result<()> {
            Ok(())
        }

        fn name(&self) -> String {
            "fixed".to_string()
        }
    }

    struct FailingModel;

    #[async_trait]
    impl LanguageModel for FailingModel {
        async fn complete(&self, _prompt: &Prompt, _params: &GenerationParams) -> Result<String> {
            Err(AgentError::GenerationFailed("offline".into()))
        }

        async fn health_check(&self) -> Result<()> {
            Err(AgentError::ExternalService("offline".into()))
        }

        fn name(&self) -> String {
            "failing".to_string()
        }
    }

    fn plain(text: &str) -> AugmentedQuery {
        AugmentedQuery {
            original: text.to_string(),
            text: text.to_string(),
            is_follow_up: false,
        }
    }

    fn today() -> NaiveDate {
        // a Wednesday
        NaiveDate::from_ymd_opt(2024, 5, 15).unwrap()
    }

    #[tokio::test]
    async fn test_reference_cases() {
        let router = IntentRouter::rules_only();

        let knowledge = router.classify_on(&plain("What's our vacation policy?"), today()).await;
        assert_eq!(knowledge.intent, Intent::KnowledgeQuery);

        let calendar = router
            .classify_on(&plain("What's on my calendar tomorrow?"), today())
            .await;
        assert_eq!(calendar.intent, Intent::CalendarQuery);
        assert_eq!(
            calendar.slots.date_range,
            Some(DateRange::single(NaiveDate::from_ymd_opt(2024, 5, 16).unwrap()))
        );

        let email = router
            .classify_on(&plain("Draft an email to Sarah about the policy"), today())
            .await;
        assert_eq!(email.intent, Intent::EmailDraft);
        assert_eq!(email.slots.recipient.as_deref(), Some("Sarah"));
        assert_eq!(email.slots.subject_hint.as_deref(), Some("the policy"));
    }

    #[tokio::test]
    async fn test_ambiguous_follow_up_defaults_to_knowledge() {
        let follow_up = AugmentedQuery {
            original: "tell me more".to_string(),
            text: "Earlier question: What's our vacation policy? Earlier answer: 25 days.\nCurrent question: tell me more".to_string(),
            is_follow_up: true,
        };

        let rules_only = IntentRouter::rules_only().classify_on(&follow_up, today()).await;
        assert_eq!(rules_only.intent, Intent::KnowledgeQuery);
        assert_eq!(rules_only.source, ClassificationSource::Default);

        // a model vote for a side-effecting intent needs a cue in the user's words
        let eager = IntentRouter::with_model(Arc::new(FixedModel("EMAIL_DRAFT")), Duration::from_secs(1));
        assert_eq!(
            eager.classify_on(&follow_up, today()).await.intent,
            Intent::KnowledgeQuery
        );
    }

    #[tokio::test]
    async fn test_model_fallback_with_cue_is_accepted() {
        let router = IntentRouter::with_model(Arc::new(FixedModel("CALENDAR_QUERY")), Duration::from_secs(1));
        let result = router
            .classify_on(&plain("remind me what is happening friday"), today())
            .await;
        assert_eq!(result.intent, Intent::CalendarQuery);
        assert_eq!(result.source, ClassificationSource::Model);
        assert_eq!(
            result.slots.date_range,
            Some(DateRange::single(NaiveDate::from_ymd_opt(2024, 5, 17).unwrap()))
        );
    }

    #[tokio::test]
    async fn test_model_failure_defaults_to_knowledge() {
        let router = IntentRouter::with_model(Arc::new(FailingModel), Duration::from_secs(1));
        let result = router.classify_on(&plain("pricing tiers for startups"), today()).await;
        assert_eq!(result.intent, Intent::KnowledgeQuery);
        assert_eq!(result.source, ClassificationSource::Default);
    }

    #[tokio::test]
    async fn test_side_effecting_intents_need_a_request() {
        let router = IntentRouter::rules_only();
        let cases = [
            ("Please write an email to HR about my leave", Intent::EmailDraft),
            ("Can you draft a mail to bob@example.com regarding the audit?", Intent::EmailDraft),
            ("I'd like to compose an email to Priya about onboarding", Intent::EmailDraft),
            ("Email Marco about the launch", Intent::EmailDraft),
            ("What's the best way to write a sales email?", Intent::KnowledgeQuery),
            ("Do I have any meetings on Friday?", Intent::CalendarQuery),
            ("When is my next meeting?", Intent::CalendarQuery),
            ("Am I free tomorrow?", Intent::CalendarQuery),
            ("Do we have a policy for meetings with clients?", Intent::KnowledgeQuery),
            ("When are company events held?", Intent::KnowledgeQuery),
        ];
        for (text, expected) in cases {
            let result = router.classify_on(&plain(text), today()).await;
            assert_eq!(result.intent, expected, "{}", text);
        }
    }

    #[tokio::test]
    async fn test_small_talk() {
        let router = IntentRouter::rules_only();
        for text in ["hi", "Thanks so much!", "good morning", "bye"] {
            assert_eq!(router.classify_on(&plain(text), today()).await.intent, Intent::Other, "{}", text);
        }
    }

    #[test]
    fn test_date_ranges() {
        let t = today();
        let d = |m, day| NaiveDate::from_ymd_opt(2024, m, day).unwrap();

        assert_eq!(extract_date_range("anything today?", t), Some(DateRange::single(t)));
        assert_eq!(extract_date_range("yesterday's meetings", t), Some(DateRange::single(d(5, 14))));
        assert_eq!(
            extract_date_range("what's this week like", t),
            Some(DateRange { start: d(5, 13), end: d(5, 19) })
        );
        assert_eq!(
            extract_date_range("meetings next week", t),
            Some(DateRange { start: d(5, 20), end: d(5, 26) })
        );
        assert_eq!(
            extract_date_range("this weekend", t),
            Some(DateRange { start: d(5, 18), end: d(5, 19) })
        );
        assert_eq!(extract_date_range("on monday", t), Some(DateRange::single(d(5, 20))));
        assert_eq!(extract_date_range("next wednesday", t), Some(DateRange::single(d(5, 22))));
        assert_eq!(extract_date_range("on 2024-06-01", t), Some(DateRange::single(d(6, 1))));
        assert_eq!(extract_date_range("no dates here", t), None);
    }

    #[test]
    fn test_email_slots() {
        assert_eq!(
            extract_email_slots("Write an email to jane.doe@example.com regarding Q3 budget."),
            (Some("jane.doe@example.com".to_string()), Some("Q3 budget".to_string()))
        );
        assert_eq!(extract_email_slots("draft an email"), (None, None));
    }

    #[test]
    fn test_model_label_parsing() {
        assert_eq!(Intent::from_model_output("calendar_query"), Some(Intent::CalendarQuery));
        assert_eq!(
            Intent::from_model_output("Label: OTHER (not EMAIL_DRAFT)"),
            Some(Intent::Other)
        );
        assert_eq!(Intent::from_model_output("no idea"), None);
    }
}
