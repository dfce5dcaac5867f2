//! Synthetic-age annotator.
//!
//! Back-dates a release-date annotation on selected deployments so that
//! downstream agent tasks can be graded on age-based policy decisions
//! ("retire anything older than 60 days"). Purely additive metadata: spec
//! fields, replica counts, and images are never touched.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tracing::{error, info};

use crate::error::AnnotateError;
use crate::kube::Kubectl;

/// Annotation key the age-audit tasks read back.
pub const RELEASE_DATE_KEY: &str = "benchmark/release-date";

/// A synthetic back-dating request for one deployment.
#[derive(Debug, Clone)]
pub struct AgeAnnotation {
    pub namespace: String,
    pub name: String,
    /// How many days old the workload should appear.
    pub age_days: i64,
}

impl AgeAnnotation {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, age_days: i64) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            age_days,
        }
    }

    /// The synthetic timestamp: `now` minus the requested age.
    pub fn synthetic_date(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.age_days)
    }
}

/// Per-entry outcome; failures never roll back earlier entries since each
/// annotation target is independent.
#[derive(Debug, Clone)]
pub struct AnnotationOutcome {
    pub namespace: String,
    pub name: String,
    pub error: Option<String>,
}

impl AnnotationOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Builds the typed merge-patch document setting the release-date
/// annotation. Merge semantics add the key if absent and preserve sibling
/// annotations.
pub fn build_patch(date: &DateTime<Utc>) -> Value {
    json!({
        "metadata": {
            "annotations": {
                RELEASE_DATE_KEY: date.to_rfc3339()
            }
        }
    })
}

/// Builds and logs the outcome for one failed entry. Every failure is
/// reported the same way regardless of whether kubectl rejected the patch or
/// never ran at all.
fn failure_outcome(entry: &AgeAnnotation, err: &AnnotateError) -> AnnotationOutcome {
    error!(
        namespace = %entry.namespace,
        deployment = %entry.name,
        error = %err,
        "Synthetic age annotation failed"
    );
    AnnotationOutcome {
        namespace: entry.namespace.clone(),
        name: entry.name.clone(),
        error: Some(err.to_string()),
    }
}

/// Applies every annotation, continuing past per-entry failures.
pub async fn annotate(kubectl: &Kubectl, annotations: &[AgeAnnotation]) -> Vec<AnnotationOutcome> {
    let now = Utc::now();
    let mut outcomes = Vec::with_capacity(annotations.len());

    for entry in annotations {
        let date = entry.synthetic_date(now);
        let patch = build_patch(&date);

        let outcome = match kubectl
            .patch_deployment_merge(&entry.namespace, &entry.name, &patch)
            .await
        {
            Ok(out) if out.success() => {
                info!(
                    namespace = %entry.namespace,
                    deployment = %entry.name,
                    release_date = %date.to_rfc3339(),
                    "Synthetic age annotation applied"
                );
                AnnotationOutcome {
                    namespace: entry.namespace.clone(),
                    name: entry.name.clone(),
                    error: None,
                }
            }
            Ok(out) => failure_outcome(
                entry,
                &AnnotateError::PatchFailed {
                    namespace: entry.namespace.clone(),
                    name: entry.name.clone(),
                    stderr: out.stderr,
                },
            ),
            Err(e) => failure_outcome(entry, &AnnotateError::Io(e)),
        };
        outcomes.push(outcome);
    }

    outcomes
}

/// Parses `namespace/name:days` annotation specs from the CLI.
pub fn parse_spec(spec: &str) -> Option<AgeAnnotation> {
    let (target, days) = spec.rsplit_once(':')?;
    let (namespace, name) = target.split_once('/')?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some(AgeAnnotation::new(namespace, name, days.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn synthetic_date_subtracts_days() {
        let now = Utc.with_ymd_and_hms(2026, 8, 25, 12, 0, 0).unwrap();
        let entry = AgeAnnotation::new("tasks", "legacy-web", 90);
        let date = entry.synthetic_date(now);
        assert_eq!(date, Utc.with_ymd_and_hms(2026, 5, 27, 12, 0, 0).unwrap());
    }

    #[test]
    fn patch_touches_only_annotations() {
        let now = Utc.with_ymd_and_hms(2026, 8, 25, 0, 0, 0).unwrap();
        let patch = build_patch(&now);

        let annotations = patch.pointer("/metadata/annotations").unwrap();
        assert!(annotations.get(RELEASE_DATE_KEY).is_some());
        // No spec fields in the document.
        assert!(patch.get("spec").is_none());
        assert_eq!(patch["metadata"].as_object().unwrap().len(), 1);
    }

    #[test]
    fn io_failures_are_recorded_per_entry() {
        let entry = AgeAnnotation::new("tasks", "legacy-web", 90);
        let err = AnnotateError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "No such file or directory",
        ));
        let outcome = failure_outcome(&entry, &err);

        assert!(!outcome.succeeded());
        assert_eq!(outcome.namespace, "tasks");
        assert_eq!(outcome.name, "legacy-web");
        assert!(outcome.error.as_deref().unwrap().contains("No such file"));
    }

    #[test]
    fn parse_spec_round_trip() {
        let entry = parse_spec("tasks/legacy-web:90").unwrap();
        assert_eq!(entry.namespace, "tasks");
        assert_eq!(entry.name, "legacy-web");
        assert_eq!(entry.age_days, 90);
    }

    #[test]
    fn parse_spec_rejects_malformed_input() {
        assert!(parse_spec("no-colon").is_none());
        assert!(parse_spec("no-slash:5").is_none());
        assert!(parse_spec("ns/name:not-a-number").is_none());
        assert!(parse_spec("/name:5").is_none());
    }
}
