//! Keyword heuristics for placement mail.
//!
//! Everything here is case-insensitive substring matching over a few header
//! fields. The word lists are plain data handed to [`Classifier::new`], so
//! tests can run against small fixture lists.

use crate::config::ClassifierOverrides;
use crate::models::{Category, NormalizedEmail};
use regex::Regex;
use std::sync::LazyLock;

static DOMAIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([a-zA-Z0-9]+)\.").unwrap());

pub const DEFAULT_PLACEMENT_KEYWORDS: &[&str] = &[
    // application
    "application", "applied", "apply", "candidate", "applicant",
    // interview
    "interview", "screening", "technical round", "hr round", "assessment",
    "coding test", "online test", "aptitude test", "hiring challenge",
    // offer
    "offer letter", "job offer", "selected", "congratulations", "welcome aboard",
    // rejection
    "regret", "unfortunately", "not selected", "not shortlisted", "rejected",
    // hiring
    "recruitment", "hiring", "job opportunity", "career", "position",
    "internship", "full-time", "placement", "campus", "walk-in",
    // companies
    "google", "microsoft", "amazon", "meta", "apple", "netflix",
    "infosys", "tcs", "wipro", "cognizant", "accenture", "deloitte",
    "goldman sachs", "morgan stanley", "jpmorgan", "uber", "flipkart",
    // platforms
    "linkedin", "naukri", "indeed", "glassdoor", "hackerrank", "hackerearth",
    "codingninjas", "leetcode", "interviewbit",
];

/// Category pattern groups in priority order. The first group with any hit
/// wins, so a mail mentioning both an interview and an offer is an interview.
pub const DEFAULT_CATEGORY_RULES: &[(Category, &[&str])] = &[
    (
        Category::Interview,
        &[
            "interview", "screening", "technical round", "hr round",
            "scheduled", "meeting invite", "video call", "zoom", "teams meeting",
        ],
    ),
    (
        Category::Assessment,
        &[
            "assessment", "test", "coding challenge", "online test",
            "aptitude", "hackerrank", "hackerearth", "codility",
        ],
    ),
    (
        Category::Offer,
        &[
            "offer letter", "job offer", "selected", "congratulations",
            "welcome", "compensation", "package", "joining",
        ],
    ),
    (
        Category::Rejection,
        &[
            "regret", "unfortunately", "not selected", "not shortlisted",
            "rejected", "not proceed", "other candidates",
        ],
    ),
    (
        Category::Application,
        &[
            "application received", "application submitted", "thank you for applying",
            "applied successfully", "resume received",
        ],
    ),
];

pub const DEFAULT_KNOWN_COMPANIES: &[&str] = &[
    "Google", "Microsoft", "Amazon", "Meta", "Apple", "Netflix",
    "Infosys", "TCS", "Wipro", "Cognizant", "Accenture", "Deloitte",
    "Goldman Sachs", "Morgan Stanley", "JPMorgan", "Uber", "Flipkart",
    "Zomato", "Swiggy", "Paytm", "Adobe", "Oracle", "IBM", "Intel",
    "Qualcomm", "Samsung", "LinkedIn", "Twitter", "Salesforce",
];

pub const DEFAULT_GENERIC_MAIL_DOMAINS: &[&str] = &["gmail", "yahoo", "outlook", "hotmail", "mail"];

#[derive(Debug, Clone, PartialEq)]
pub struct CategoryRule {
    pub category: Category,
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierConfig {
    pub keywords: Vec<String>,
    pub category_rules: Vec<CategoryRule>,
    pub companies: Vec<String>,
    pub generic_domains: Vec<String>,
}

fn owned(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            keywords: owned(DEFAULT_PLACEMENT_KEYWORDS),
            category_rules: DEFAULT_CATEGORY_RULES
                .iter()
                .map(|(category, patterns)| CategoryRule {
                    category: *category,
                    patterns: owned(patterns),
                })
                .collect(),
            companies: owned(DEFAULT_KNOWN_COMPANIES),
            generic_domains: owned(DEFAULT_GENERIC_MAIL_DOMAINS),
        }
    }
}

impl ClassifierConfig {
    pub fn with_overrides(overrides: &ClassifierOverrides) -> Self {
        let mut config = Self::default();
        if let Some(keywords) = &overrides.keywords {
            config.keywords = keywords.clone();
        }
        if let Some(companies) = &overrides.companies {
            config.companies = companies.clone();
        }
        if let Some(domains) = &overrides.generic_domains {
            config.generic_domains = domains.clone();
        }
        config
    }
}

#[derive(Debug, Clone)]
pub struct Classifier {
    keywords: Vec<String>,
    keywords_lower: Vec<String>,
    rules: Vec<(Category, Vec<String>)>,
    /// (display name, lower-cased needle)
    companies: Vec<(String, String)>,
    generic_domains: Vec<String>,
}

impl Classifier {
    pub fn new(config: ClassifierConfig) -> Self {
        let lower = |list: &[String]| list.iter().map(|s| s.to_lowercase()).collect::<Vec<_>>();
        Self {
            keywords_lower: lower(&config.keywords),
            keywords: config.keywords,
            rules: config
                .category_rules
                .into_iter()
                .map(|rule| (rule.category, lower(&rule.patterns)))
                .collect(),
            companies: config
                .companies
                .into_iter()
                .map(|name| {
                    let needle = name.to_lowercase();
                    (name, needle)
                })
                .collect(),
            generic_domains: lower(&config.generic_domains),
        }
    }

    /// The first `cap` relevance keywords, in list order.
    pub fn query_terms(&self, cap: usize) -> &[String] {
        &self.keywords[..cap.min(self.keywords.len())]
    }

    pub fn is_relevant(&self, email: &NormalizedEmail) -> bool {
        let content = format!("{} {} {}", email.subject, email.snippet, email.from).to_lowercase();
        self.keywords_lower.iter().any(|k| content.contains(k.as_str()))
    }

    pub fn categorize(&self, email: &NormalizedEmail) -> Category {
        let content = format!("{} {}", email.subject, email.snippet).to_lowercase();
        self.rules
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|p| content.contains(p.as_str())))
            .map(|(category, _)| *category)
            .unwrap_or(Category::Other)
    }

    /// Known company names first, then the sender's domain label unless it is
    /// a generic mail host.
    pub fn extract_company(&self, email: &NormalizedEmail) -> Option<String> {
        let content = format!("{} {}", email.subject, email.from).to_lowercase();
        if let Some((name, _)) = self
            .companies
            .iter()
            .find(|(_, needle)| content.contains(needle.as_str()))
        {
            return Some(name.clone());
        }

        let domain = DOMAIN_RE.captures(&email.from)?.get(1)?.as_str();
        if self
            .generic_domains
            .iter()
            .any(|g| g.eq_ignore_ascii_case(domain))
        {
            return None;
        }
        Some(capitalize(domain))
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;

    pub(crate) fn email(from: &str, subject: &str, snippet: &str) -> NormalizedEmail {
        NormalizedEmail {
            provider_message_id: "m1".to_string(),
            thread_id: None,
            from: from.to_string(),
            to: "me@example.com".to_string(),
            subject: subject.to_string(),
            snippet: snippet.to_string(),
            body: String::new(),
            date: Utc::now(),
            labels: vec![],
            is_read: false,
            category: Category::Other,
            company: None,
            fetched_at: Utc::now(),
        }
    }

    fn production() -> Classifier {
        Classifier::new(ClassifierConfig::default())
    }

    #[test]
    fn relevance_matches_any_keyword_in_subject_snippet_or_from() {
        let c = production();
        assert!(c.is_relevant(&email("hr@acme.io", "Your Application status", "")));
        assert!(c.is_relevant(&email("jobs@naukri.com", "Weekly digest", "")));
        assert!(c.is_relevant(&email("a@b.io", "hello", "we regret to inform you")));
        assert!(!c.is_relevant(&email("friend@example.org", "Lunch on Friday?", "see you there")));
    }

    #[test]
    fn interview_wins_over_offer() {
        let c = production();
        let mail = email(
            "hr@acme.io",
            "Interview feedback and job offer",
            "congratulations",
        );
        assert_eq!(c.categorize(&mail), Category::Interview);
    }

    #[test]
    fn categorize_walks_rules_in_order() {
        let c = production();
        assert_eq!(
            c.categorize(&email("x@y.io", "Online test link", "")),
            Category::Assessment
        );
        assert_eq!(
            c.categorize(&email("x@y.io", "Update", "Unfortunately we will not proceed")),
            Category::Rejection
        );
        assert_eq!(
            c.categorize(&email("x@y.io", "Thank you for applying", "")),
            Category::Application
        );
        assert_eq!(c.categorize(&email("x@y.io", "Newsletter", "")), Category::Other);
    }

    #[test]
    fn category_order_comes_from_config() {
        let c = Classifier::new(ClassifierConfig {
            keywords: vec![],
            category_rules: vec![
                CategoryRule {
                    category: Category::Offer,
                    patterns: vec!["offer".to_string()],
                },
                CategoryRule {
                    category: Category::Interview,
                    patterns: vec!["interview".to_string()],
                },
            ],
            companies: vec![],
            generic_domains: vec![],
        });
        let mail = email("x@y.io", "Interview and offer", "");
        assert_eq!(c.categorize(&mail), Category::Offer);
    }

    #[test]
    fn known_company_keeps_list_casing() {
        let c = production();
        let mail = email("careers@talent.goldmansachs.com", "GOLDMAN SACHS: next steps", "");
        assert_eq!(c.extract_company(&mail).as_deref(), Some("Goldman Sachs"));
    }

    #[test]
    fn company_falls_back_to_sender_domain() {
        let c = production();
        let mail = email("noreply@coolstartup.io", "Next steps", "");
        assert_eq!(c.extract_company(&mail).as_deref(), Some("Coolstartup"));
    }

    #[test]
    fn generic_mail_hosts_are_not_companies() {
        let c = production();
        assert_eq!(c.extract_company(&email("x@gmail.com", "Hi", "")), None);
        assert_eq!(c.extract_company(&email("Recruiter <x@Outlook.com>", "Hi", "")), None);
        assert_eq!(c.extract_company(&email("no address here", "Hi", "")), None);
    }

    #[test]
    fn query_terms_are_capped() {
        let c = production();
        assert_eq!(c.query_terms(20).len(), 20);
        assert_eq!(c.query_terms(20)[0], "application");
        assert_eq!(c.query_terms(1000).len(), DEFAULT_PLACEMENT_KEYWORDS.len());
    }

    #[test]
    fn overrides_replace_only_given_lists() {
        let config = ClassifierConfig::with_overrides(&ClassifierOverrides {
            keywords: None,
            companies: Some(vec!["Acme".to_string()]),
            generic_domains: None,
        });
        assert_eq!(config.companies, vec!["Acme".to_string()]);
        assert_eq!(config.keywords.len(), DEFAULT_PLACEMENT_KEYWORDS.len());

        let c = Classifier::new(config);
        assert_eq!(
            c.extract_company(&email("x@acme.dev", "ACME onsite", "")).as_deref(),
            Some("Acme")
        );
        assert_eq!(c.extract_company(&email("x@yahoo.com", "Google", "")), None);
    }
}
