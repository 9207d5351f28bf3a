use serde::Deserialize;

/// A job identifier seen on a listing page, before any detail fetch.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveredJob {
    pub title: String,
    pub sponsored: bool,
}

/// Result of a detail fetch for one job id. The fetch layer hands these
/// over as JSON maps; a bare `{"error": true}` marks a fetch or parse
/// failure that should park the job in the error state.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EnrichmentOutcome {
    Error(ErrorMarker),
    Detail(Box<JobDetail>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorMarker {
    pub error: bool,
}

/// One enrichment payload. Every section is optional; different fetches
/// return different completeness.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobDetail {
    pub jobs: Option<JobFields>,
    pub industries: Option<IndustrySection>,
    pub skills: Option<SkillSection>,
    pub companies: Option<CompanyFields>,
    pub company_industries: Option<CompanyIndustrySection>,
    pub company_specialities: Option<CompanySpecialitySection>,
}

/// Scalar columns of the `jobs` table that a detail payload may carry.
/// This is the full whitelist: the merger only ever writes columns
/// enumerated by `assignments`, never caller-supplied names.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobFields {
    pub company_id: Option<i64>,
    pub work_type: Option<String>,
    pub formatted_work_type: Option<String>,
    pub location: Option<String>,
    pub job_posting_url: Option<String>,
    pub applies: Option<i64>,
    pub original_listed_time: Option<String>,
    pub remote_allowed: Option<i64>,
    pub application_url: Option<String>,
    pub application_type: Option<String>,
    pub expiry: Option<String>,
    pub closed_time: Option<String>,
    pub formatted_experience_level: Option<String>,
    pub description: Option<String>,
    pub title: Option<String>,
    pub skills_desc: Option<String>,
    pub views: Option<i64>,
    pub listed_time: Option<String>,
    pub posting_domain: Option<String>,
    pub sponsored: Option<i64>,
    pub applicant_tracking_system: Option<String>,
    pub job_state: Option<String>,
    pub workplace_type: Option<String>,
}

impl JobFields {
    /// Column/value pairs for every field present in this payload, with
    /// statically known column names.
    pub fn assignments(&self) -> Vec<(&'static str, rusqlite::types::Value)> {
        use rusqlite::types::Value;

        fn text(v: &Option<String>) -> Option<Value> {
            v.as_ref().map(|s| Value::Text(s.clone()))
        }
        fn int(v: &Option<i64>) -> Option<Value> {
            v.map(Value::Integer)
        }

        let columns: [(&'static str, Option<Value>); 23] = [
            ("company_id", int(&self.company_id)),
            ("work_type", text(&self.work_type)),
            ("formatted_work_type", text(&self.formatted_work_type)),
            ("location", text(&self.location)),
            ("job_posting_url", text(&self.job_posting_url)),
            ("applies", int(&self.applies)),
            ("original_listed_time", text(&self.original_listed_time)),
            ("remote_allowed", int(&self.remote_allowed)),
            ("application_url", text(&self.application_url)),
            ("application_type", text(&self.application_type)),
            ("expiry", text(&self.expiry)),
            ("closed_time", text(&self.closed_time)),
            (
                "formatted_experience_level",
                text(&self.formatted_experience_level),
            ),
            ("description", text(&self.description)),
            ("title", text(&self.title)),
            ("skills_desc", text(&self.skills_desc)),
            ("views", int(&self.views)),
            ("listed_time", text(&self.listed_time)),
            ("posting_domain", text(&self.posting_domain)),
            ("sponsored", int(&self.sponsored)),
            (
                "applicant_tracking_system",
                text(&self.applicant_tracking_system),
            ),
            ("job_state", text(&self.job_state)),
            ("workplace_type", text(&self.workplace_type)),
        ];

        columns
            .into_iter()
            .filter_map(|(name, value)| value.map(|v| (name, v)))
            .collect()
    }
}

/// Industry ids for a job, with names paired by index when present.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IndustrySection {
    pub industry_ids: Vec<i64>,
    pub industry_names: Option<Vec<Option<String>>>,
}

/// Skill codes for a job. The name list key is `skill_name` (singular),
/// matching what the fetch layer emits.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SkillSection {
    pub skill_abrs: Vec<String>,
    pub skill_name: Option<Vec<Option<String>>>,
}

/// Company record; replaced wholesale on every write, so no per-field
/// merge semantics here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompanyFields {
    pub name: Option<String>,
    pub country: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompanyIndustrySection {
    pub industries: Vec<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompanySpecialitySection {
    pub specialities: Vec<i64>,
}

/// Lifecycle state decoded from the `jobs.scraped` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Error,
    Scraped(i64), // epoch seconds of the successful enrichment
}

impl JobState {
    pub fn from_scraped(scraped: i64) -> Self {
        match scraped {
            0 => JobState::Pending,
            -1 => JobState::Error,
            ts => JobState::Scraped(ts),
        }
    }
}

/// Read model for CLI display.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub job_id: i64,
    pub scraped: i64,
    pub title: Option<String>,
    pub company_id: Option<i64>,
    pub location: Option<String>,
    pub sponsored: Option<i64>,
}

impl JobRow {
    pub fn state(&self) -> JobState {
        JobState::from_scraped(self.scraped)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StateCounts {
    pub pending: i64,
    pub scraped: i64,
    pub errored: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_decodes_error_marker() {
        let outcome: EnrichmentOutcome = serde_json::from_str(r#"{"error": true}"#).unwrap();
        assert!(matches!(outcome, EnrichmentOutcome::Error(_)));
    }

    #[test]
    fn test_outcome_decodes_detail() {
        let raw = r#"{
            "jobs": {"company_id": 5, "title": "Engineer", "views": 12},
            "industries": {"industry_ids": [9], "industry_names": ["Tech"]},
            "skills": {"skill_abrs": ["py"], "skill_name": [null]},
            "companies": {"name": "Acme", "country": "US", "url": "https://acme.example"},
            "company_industries": {"industries": [9]},
            "company_specialities": {"specialities": [3, 4]}
        }"#;
        let outcome: EnrichmentOutcome = serde_json::from_str(raw).unwrap();
        let detail = match outcome {
            EnrichmentOutcome::Detail(d) => d,
            EnrichmentOutcome::Error(_) => panic!("decoded as error marker"),
        };
        let jobs = detail.jobs.unwrap();
        assert_eq!(jobs.company_id, Some(5));
        assert_eq!(jobs.title.as_deref(), Some("Engineer"));
        assert_eq!(detail.skills.unwrap().skill_name, Some(vec![None]));
        assert_eq!(
            detail.company_specialities.unwrap().specialities,
            vec![3, 4]
        );
    }

    #[test]
    fn test_assignments_skip_absent_fields() {
        let fields = JobFields {
            title: Some("Engineer".into()),
            views: Some(3),
            ..Default::default()
        };
        let set = fields.assignments();
        let names: Vec<&str> = set.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["title", "views"]);
    }

    #[test]
    fn test_state_from_scraped() {
        assert_eq!(JobState::from_scraped(0), JobState::Pending);
        assert_eq!(JobState::from_scraped(-1), JobState::Error);
        assert_eq!(
            JobState::from_scraped(1_700_000_000),
            JobState::Scraped(1_700_000_000)
        );
    }
}
