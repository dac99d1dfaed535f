use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use super::JobSource;
use crate::error::JobSourceError;
use crate::job::{Job, JobId, JobOutcome};

/// Job queue behind a REST service.
///
/// `GET {base}/jobs?status=pending&limit=N` lists jobs, `POST
/// {base}/jobs/{id}/claim` claims one (409 when taken) and `POST
/// {base}/jobs/{id}/result` publishes the outcome. Job ids are
/// percent-encoded as single path segments.
#[derive(Clone)]
pub struct HttpJobSource {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl std::fmt::Debug for HttpJobSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpJobSource")
            .field("base_url", &self.base_url.as_str())
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct PendingJob {
    id: serde_json::Value,
    question: String,
}

impl HttpJobSource {
    /// # Errors
    ///
    /// Returns an error if `base_url` is not an absolute hierarchical URL or
    /// the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, JobSourceError> {
        let base = Url::parse(base_url)
            .map_err(|e| JobSourceError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(JobSourceError::InvalidUrl(base_url.to_owned()));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("docent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base,
            token,
        })
    }

    /// `base_url` with `segments` appended, each percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, JobSourceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| JobSourceError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let req = self.client.request(method, url);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn expect_success(
        id: &JobId,
        response: reqwest::Response,
    ) -> Result<(), JobSourceError> {
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(JobSourceError::Conflict(id.0.clone())),
            StatusCode::NOT_FOUND => Err(JobSourceError::NotFound(id.0.clone())),
            status => Err(JobSourceError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

impl JobSource for HttpJobSource {
    async fn list_pending(&self, limit: usize) -> Result<Vec<Job>, JobSourceError> {
        let mut url = self.endpoint(&["jobs"])?;
        url.query_pairs_mut()
            .append_pair("status", "pending")
            .append_pair("limit", &limit.to_string());
        let response = self.request(reqwest::Method::GET, url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(JobSourceError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let body = response.text().await?;
        let jobs: Vec<PendingJob> = serde_json::from_str(&body)?;
        Ok(jobs
            .into_iter()
            .take(limit)
            .map(|job| Job {
                id: match job.id {
                    serde_json::Value::String(s) => JobId(s),
                    other => JobId(other.to_string()),
                },
                question: job.question,
            })
            .collect())
    }

    async fn claim(&self, id: &JobId) -> Result<(), JobSourceError> {
        let url = self.endpoint(&["jobs", id.0.as_str(), "claim"])?;
        let response = self.request(reqwest::Method::POST, url).send().await?;
        Self::expect_success(id, response).await
    }

    async fn publish(&self, id: &JobId, outcome: &JobOutcome) -> Result<(), JobSourceError> {
        let url = self.endpoint(&["jobs", id.0.as_str(), "result"])?;
        let response = self
            .request(reqwest::Method::POST, url)
            .json(outcome)
            .send()
            .await?;
        Self::expect_success(id, response).await
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::job::Answer;

    fn source(server: &MockServer) -> HttpJobSource {
        HttpJobSource::new(&server.uri(), None, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn lists_pending_jobs_with_numeric_and_string_ids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jobs"))
            .and(query_param("status", "pending"))
            .and(query_param("limit", "5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": 7, "question": "How do I submit a job?"},
                {"id": "abc", "question": "What is my quota?"}
            ])))
            .mount(&server)
            .await;

        let jobs = source(&server).list_pending(5).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, JobId::from("7"));
        assert_eq!(jobs[1].id, JobId::from("abc"));
        assert_eq!(jobs[1].question, "What is my quota?");
    }

    #[tokio::test]
    async fn sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jobs"))
            .and(header("authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let source =
            HttpJobSource::new(&server.uri(), Some("s3cret".into()), Duration::from_secs(5))
                .unwrap();
        assert!(source.list_pending(1).await.unwrap().is_empty());
        assert!(!format!("{source:?}").contains("s3cret"));
    }

    #[tokio::test]
    async fn claim_conflict_maps_to_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jobs/7/claim"))
            .respond_with(ResponseTemplate::new(200))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/jobs/7/claim"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let source = source(&server);
        let id = JobId::from("7");
        source.claim(&id).await.unwrap();
        assert!(matches!(
            source.claim(&id).await,
            Err(JobSourceError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn publish_posts_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jobs/7/result"))
            .and(body_json(serde_json::json!({
                "status": "answered",
                "text": "Use sbatch.",
                "sources": ["c1"],
                "references": ["https://docs.example.org/jobs/"]
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = JobOutcome::Answered(Answer {
            text: "Use sbatch.".into(),
            sources: vec!["c1".into()],
            references: vec!["https://docs.example.org/jobs/".into()],
        });
        source(&server)
            .publish(&JobId::from("7"), &outcome)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn server_error_is_reported_with_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jobs"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = source(&server).list_pending(1).await.unwrap_err();
        assert!(matches!(
            err,
            JobSourceError::Status { status: 503, ref body } if body == "maintenance"
        ));
    }

    #[tokio::test]
    async fn job_ids_are_encoded_as_one_segment() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jobs/a%2Fb%20c/claim"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/jobs/a%2Fb%20c/result"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let source = source(&server);
        let id = JobId::from("a/b c");
        source.claim(&id).await.unwrap();
        let outcome = JobOutcome::Failed {
            message: "ERROR: nope".into(),
        };
        source.publish(&id, &outcome).await.unwrap();
    }

    #[tokio::test]
    async fn base_path_is_kept() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/jobs"))
            .and(query_param("limit", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let source = HttpJobSource::new(
            &format!("{}/api/v2/", server.uri()),
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(source.list_pending(3).await.unwrap().is_empty());
    }

    #[test]
    fn relative_base_url_is_rejected() {
        assert!(matches!(
            HttpJobSource::new("jobs.example.org", None, Duration::from_secs(1)),
            Err(JobSourceError::InvalidUrl(_))
        ));
    }
}
