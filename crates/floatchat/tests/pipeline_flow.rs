use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use floatchat::error::{CompletionError, PipelineError, RetrievalUnavailable};
use floatchat::llm::{CompletionClient, CompletionRequest, ModelParams};
use floatchat::models::QuerySource;
use floatchat::narrate::{AGGREGATION_REDIRECT_MESSAGE, Narration, NarrationGenerator, NarrationSettings};
use floatchat::pipeline::{AMBIGUOUS_QUESTION_NOTE, AskPipeline, PipelineComponents};
use floatchat::prompts::PromptSet;
use floatchat::retrieval::{ContextRetriever, ContextSnippet};
use floatchat::schema::SchemaDescriptor;
use floatchat::sql::{QueryLimits, QueryValidator};
use floatchat::store::ProfileStore;
use floatchat::synth::{QuerySynthesizer, SynthesizerSettings};

const SYNTH_MODEL: &str = "synth-test";
const NARRATE_MODEL: &str = "narrate-test";

static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time should be after unix epoch")
        .as_nanos();
    let sequence = TEMP_COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!("{prefix}-{nanos}-{sequence}"))
}

fn write_fixture_store(path: &Path, descriptor: &SchemaDescriptor) {
    let connection = rusqlite::Connection::open(path).expect("fixture store should open");
    connection
        .execute_batch(&descriptor.create_table_sql())
        .expect("fixture table should be created");
    let rows = [
        (2902746.0, 12, 10.2, 80.4, "2025-01-14", "[5.0, 10.0, 20.0]", "[28.1, 27.9, 27.2]", "[34.5, 34.6, 34.8]"),
        (2902746.0, 13, 10.9, 79.8, "2025-01-24", "[5.0, 10.0]", "[28.4, nan]", "[34.4, 34.5]"),
        (2902115.0, 40, 13.1, 84.2, "2025-03-02", "[4.0, 12.0]", "[29.0, 28.2]", "[33.9, 34.1]"),
    ];
    for (platform, cycle, lat, lon, date, pres, temp, psal) in rows {
        connection
            .execute(
                "INSERT INTO profiles (PLATFORM_NUMBER, CYCLE_NUMBER, LATITUDE, LONGITUDE, PROFILE_DATE, PRES, TEMP, PSAL, DATA_MODE) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'R')",
                rusqlite::params![platform, cycle, lat, lon, date, pres, temp, psal],
            )
            .expect("fixture row should insert");
    }
}

enum Reply {
    Outcome(Result<String, CompletionError>),
    Stall,
}

/// Replies are scripted per model so synthesis and narration can share one
/// client while staying independent.
#[derive(Default)]
struct ScriptedClient {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedClient {
    fn reply(self, model: &str, outcome: Result<&str, CompletionError>) -> Self {
        self.push(model, Reply::Outcome(outcome.map(ToString::to_string)))
    }

    /// The call never answers; the caller's timeout has to end it.
    fn stall(self, model: &str) -> Self {
        self.push(model, Reply::Stall)
    }

    fn push(self, model: &str, reply: Reply) -> Self {
        self.replies
            .lock()
            .expect("replies lock")
            .entry(model.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    fn requests_for(&self, model: &str) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .expect("requests lock")
            .iter()
            .filter(|request| request.params.model == model)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let reply = self
            .replies
            .lock()
            .expect("replies lock")
            .get_mut(&request.params.model)
            .and_then(VecDeque::pop_front);
        match reply {
            Some(Reply::Outcome(outcome)) => outcome,
            Some(Reply::Stall) => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Err(CompletionError::Decode("stalled reply finished".to_string()))
            }
            None => Err(CompletionError::Decode("no scripted reply".to_string())),
        }
    }
}

enum RetrieverBehavior {
    Snippets(Vec<&'static str>),
    Unavailable,
    Stalled,
}

struct FakeRetriever(RetrieverBehavior);

#[async_trait]
impl ContextRetriever for FakeRetriever {
    async fn search(
        &self,
        _question: &str,
        k: usize,
    ) -> Result<Vec<ContextSnippet>, RetrievalUnavailable> {
        match &self.0 {
            RetrieverBehavior::Snippets(texts) => Ok(texts
                .iter()
                .take(k)
                .enumerate()
                .map(|(rank, text)| ContextSnippet {
                    rank,
                    text: (*text).to_string(),
                    score: None,
                })
                .collect()),
            RetrieverBehavior::Unavailable => {
                Err(RetrievalUnavailable("connection refused".to_string()))
            }
            RetrieverBehavior::Stalled => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Vec::new())
            }
        }
    }
}

struct Harness {
    pipeline: AskPipeline,
    client: Arc<ScriptedClient>,
}

fn harness(client: ScriptedClient, retriever: RetrieverBehavior) -> Harness {
    harness_with_timeout(client, retriever, Duration::from_secs(5))
}

fn harness_with_timeout(
    client: ScriptedClient,
    retriever: RetrieverBehavior,
    generation_timeout: Duration,
) -> Harness {
    let temp = unique_temp_dir("floatchat-pipeline");
    std::fs::create_dir_all(&temp).expect("temp dir should be creatable");
    let descriptor = Arc::new(SchemaDescriptor::argo_profiles("profiles"));
    let store_path = temp.join("argo.db");
    write_fixture_store(&store_path, &descriptor);
    harness_with_store(client, retriever, descriptor, store_path, generation_timeout)
}

fn harness_with_store(
    client: ScriptedClient,
    retriever: RetrieverBehavior,
    descriptor: Arc<SchemaDescriptor>,
    store_path: PathBuf,
    generation_timeout: Duration,
) -> Harness {
    let client = Arc::new(client);
    let completion: Arc<dyn CompletionClient> = client.clone();
    let prompts = Arc::new(PromptSet::default());
    let params = |model: &str| ModelParams {
        model: model.to_string(),
        temperature: 0.0,
        max_tokens: None,
    };

    let pipeline = AskPipeline::new(PipelineComponents {
        descriptor: Arc::clone(&descriptor),
        validator: Arc::new(QueryValidator::new(
            Arc::clone(&descriptor),
            QueryLimits::default(),
        )),
        retriever: Arc::new(FakeRetriever(retriever)),
        synthesizer: QuerySynthesizer::new(
            Arc::clone(&completion),
            Arc::clone(&prompts),
            SynthesizerSettings {
                params: params(SYNTH_MODEL),
                timeout: generation_timeout,
                max_transport_retries: 1,
                max_limit: 200,
            },
        ),
        narrator: NarrationGenerator::new(
            completion,
            prompts,
            NarrationSettings {
                params: params(NARRATE_MODEL),
                timeout: generation_timeout,
                max_transport_retries: 1,
            },
        ),
        store: Arc::new(ProfileStore::new(
            store_path,
            Arc::clone(&descriptor),
            200,
            Duration::from_millis(500),
        )),
        snippet_count: 3,
        retrieval_timeout: Duration::from_millis(200),
    });

    Harness { pipeline, client }
}

fn service_refusal() -> CompletionError {
    CompletionError::Rejected {
        status: 401,
        body: "invalid api key".to_string(),
    }
}

#[tokio::test]
async fn aggregate_question_redirects_narration_and_constrains_query() {
    let client = ScriptedClient::default().reply(
        SYNTH_MODEL,
        Ok("```sql\nSELECT AVG(LATITUDE) AS mean_lat, COUNT(*) AS profiles_used FROM profiles WHERE LATITUDE BETWEEN 5 AND 15 AND LONGITUDE BETWEEN 75 AND 85 AND PROFILE_DATE BETWEEN '2025-01-01' AND '2025-01-31'\n```"),
    );
    let harness = harness(
        client,
        RetrieverBehavior::Snippets(vec!["Float 2902746 near 10N 80E, January 2025"]),
    );

    let response = harness
        .pipeline
        .ask("average temperature near 10N 80E in January 2025")
        .await
        .expect("ask should succeed");

    assert_eq!(
        response.narration.as_ref().map(Narration::text),
        Some(AGGREGATION_REDIRECT_MESSAGE)
    );
    assert!(harness.client.requests_for(NARRATE_MODEL).is_empty());

    let query = response.validated_query.as_deref().expect("query should be present");
    assert!(query.contains("AVG("));
    assert!(query.contains("LATITUDE BETWEEN"));
    assert!(query.contains("LONGITUDE BETWEEN"));
    assert!(query.contains("PROFILE_DATE BETWEEN"));
    assert!(query.ends_with("LIMIT 200"));
    assert_eq!(response.query_source, Some(QuerySource::Synthesized));

    let table = response.result_table.as_ref().expect("table should be present");
    assert_eq!(table.columns, vec!["mean_lat", "profiles_used"]);
    assert_eq!(table.row_count, 1);
    assert!(response.failures.is_empty());
    assert!(!response.is_partial());
}

#[tokio::test]
async fn ambiguous_question_uses_fallback_without_synthesis() {
    let client = ScriptedClient::default().reply(NARRATE_MODEL, Ok("Floats drift with currents."));
    let harness = harness(
        client,
        RetrieverBehavior::Snippets(vec!["Float 2902115 reported from the Bay of Bengal"]),
    );

    let response = harness
        .pipeline
        .ask("tell me something")
        .await
        .expect("ask should succeed");

    assert!(harness.client.requests_for(SYNTH_MODEL).is_empty());
    assert_eq!(response.query_source, Some(QuerySource::Fallback));
    assert_eq!(
        response.validated_query.as_deref(),
        Some(
            "SELECT PLATFORM_NUMBER, CYCLE_NUMBER, LATITUDE, LONGITUDE, PROFILE_DATE, PRES, TEMP, PSAL FROM profiles LIMIT 200"
        )
    );
    assert!(response.notes.iter().any(|note| note == AMBIGUOUS_QUESTION_NOTE));
    assert_eq!(
        response.narration,
        Some(Narration::Grounded {
            text: "Floats drift with currents.".to_string()
        })
    );

    let table = response.result_table.as_ref().expect("table should be present");
    assert_eq!(table.row_count, 3);
    let charts = response.charts.as_ref().expect("charts should be planned");
    assert!(charts.charts.iter().any(|chart| chart.is_planned()));
}

#[tokio::test]
async fn rejected_candidate_is_retried_with_feedback() {
    let client = ScriptedClient::default()
        .reply(SYNTH_MODEL, Ok("SELECT PSAL FROM profiles"))
        .reply(
            SYNTH_MODEL,
            Ok("SELECT PLATFORM_NUMBER, PROFILE_DATE, PSAL FROM profiles WHERE PROFILE_DATE LIKE '2025-03%'"),
        )
        .reply(NARRATE_MODEL, Ok("Salinity stayed near 34 PSU."));
    let harness = harness(
        client,
        RetrieverBehavior::Snippets(vec!["March 2025 salinity profile from 2902115"]),
    );

    let response = harness
        .pipeline
        .ask("salinity profiles in March 2025")
        .await
        .expect("ask should succeed");

    assert_eq!(response.query_source, Some(QuerySource::Corrected));
    assert!(
        response
            .notes
            .iter()
            .any(|note| note.starts_with("First generated query was rejected"))
    );

    let requests = harness.client.requests_for(SYNTH_MODEL);
    assert_eq!(requests.len(), 2);
    assert!(!requests[0].user_prompt.contains("previous answer was rejected"));
    assert!(requests[1].user_prompt.contains("Your previous answer was rejected."));
    assert!(requests[1].user_prompt.contains("SELECT PSAL FROM profiles"));
    assert!(requests[1].user_prompt.contains("missing_temporal_filter"));

    let table = response.result_table.as_ref().expect("table should be present");
    assert_eq!(table.row_count, 1);
}

#[tokio::test]
async fn twice_rejected_synthesis_falls_back() {
    let client = ScriptedClient::default()
        .reply(SYNTH_MODEL, Ok("DELETE FROM profiles"))
        .reply(SYNTH_MODEL, Ok("SELECT * FROM profiles; DROP TABLE profiles;"))
        .reply(NARRATE_MODEL, Ok("Recent profiles are listed below."));
    let harness = harness(
        client,
        RetrieverBehavior::Snippets(vec!["profile summary"]),
    );

    let response = harness
        .pipeline
        .ask("show temperature profiles")
        .await
        .expect("ask should succeed");

    assert_eq!(response.query_source, Some(QuerySource::Fallback));
    assert!(
        response
            .notes
            .iter()
            .any(|note| note.starts_with("Generated query was rejected twice"))
    );
    assert!(response.failures.is_empty());
    assert_eq!(
        response.result_table.as_ref().map(|table| table.row_count),
        Some(3)
    );
}

#[tokio::test]
async fn synthesis_outage_keeps_narration() {
    let client = ScriptedClient::default()
        .reply(SYNTH_MODEL, Err(service_refusal()))
        .reply(NARRATE_MODEL, Ok("Float 2902746 sampled the upper 20 dbar."));
    let harness = harness(
        client,
        RetrieverBehavior::Snippets(vec!["Float 2902746 profile near 10N"]),
    );

    let response = harness
        .pipeline
        .ask("show temperature profiles near 10N 80E")
        .await
        .expect("partial response expected");

    assert!(response.is_partial());
    assert_eq!(response.failures.len(), 1);
    assert_eq!(response.failures[0].code, "synthesis_unavailable");
    assert!(response.validated_query.is_none());
    assert!(response.result_table.is_none());
    assert!(response.charts.is_none());
    assert_eq!(
        response.narration.as_ref().map(Narration::text),
        Some("Float 2902746 sampled the upper 20 dbar.")
    );
}

#[tokio::test]
async fn narration_outage_keeps_query_result() {
    let client = ScriptedClient::default()
        .reply(
            SYNTH_MODEL,
            Ok("SELECT PLATFORM_NUMBER, TEMP FROM profiles WHERE DATA_MODE = 'R'"),
        )
        .reply(NARRATE_MODEL, Err(service_refusal()));
    let harness = harness(
        client,
        RetrieverBehavior::Snippets(vec!["real-time temperature profiles"]),
    );

    let response = harness
        .pipeline
        .ask("list temperature profiles")
        .await
        .expect("partial response expected");

    assert!(response.narration.is_none());
    assert_eq!(response.failures.len(), 1);
    assert_eq!(response.failures[0].code, "narration_unavailable");
    assert_eq!(
        response.result_table.as_ref().map(|table| table.row_count),
        Some(3)
    );
}

#[tokio::test]
async fn stalled_narration_times_out_and_keeps_query_result() {
    let client = ScriptedClient::default()
        .reply(
            SYNTH_MODEL,
            Ok("SELECT PLATFORM_NUMBER, TEMP FROM profiles WHERE DATA_MODE = 'R'"),
        )
        .stall(NARRATE_MODEL)
        .stall(NARRATE_MODEL);
    let harness = harness_with_timeout(
        client,
        RetrieverBehavior::Snippets(vec!["real-time temperature profiles"]),
        Duration::from_millis(100),
    );

    let response = harness
        .pipeline
        .ask("list temperature profiles")
        .await
        .expect("partial response expected");

    assert!(response.is_partial());
    assert!(response.narration.is_none());
    assert_eq!(response.failures.len(), 1);
    assert_eq!(response.failures[0].code, "narration_unavailable");
    assert!(response.failures[0].message.contains("timed out"));
    assert_eq!(harness.client.requests_for(NARRATE_MODEL).len(), 2);
    assert_eq!(
        response.result_table.as_ref().map(|table| table.row_count),
        Some(3)
    );
}

#[tokio::test]
async fn stalled_synthesis_times_out_and_keeps_narration() {
    let client = ScriptedClient::default()
        .stall(SYNTH_MODEL)
        .stall(SYNTH_MODEL)
        .reply(NARRATE_MODEL, Ok("Float 2902746 sampled the upper 20 dbar."));
    let harness = harness_with_timeout(
        client,
        RetrieverBehavior::Snippets(vec!["Float 2902746 profile near 10N"]),
        Duration::from_millis(100),
    );

    let response = harness
        .pipeline
        .ask("show temperature profiles near 10N 80E")
        .await
        .expect("partial response expected");

    assert!(response.is_partial());
    assert_eq!(response.failures.len(), 1);
    assert_eq!(response.failures[0].code, "synthesis_unavailable");
    assert!(response.failures[0].message.contains("timed out"));
    assert_eq!(harness.client.requests_for(SYNTH_MODEL).len(), 2);
    assert!(response.result_table.is_none());
    assert_eq!(
        response.narration.as_ref().map(Narration::text),
        Some("Float 2902746 sampled the upper 20 dbar.")
    );
}

#[tokio::test]
async fn both_halves_failing_returns_the_query_error() {
    let client = ScriptedClient::default()
        .reply(SYNTH_MODEL, Err(service_refusal()))
        .reply(NARRATE_MODEL, Err(service_refusal()));
    let harness = harness(client, RetrieverBehavior::Snippets(vec!["context"]));

    let error = harness
        .pipeline
        .ask("list temperature profiles")
        .await
        .expect_err("both halves failed");

    assert!(matches!(error, PipelineError::SynthesisUnavailable(_)));
}

#[tokio::test]
async fn transport_failures_are_retried_once() {
    let client = ScriptedClient::default()
        .reply(SYNTH_MODEL, Err(CompletionError::Transport("reset".to_string())))
        .reply(SYNTH_MODEL, Ok("SELECT PLATFORM_NUMBER, TEMP FROM profiles"))
        .reply(NARRATE_MODEL, Ok("Three profiles."));
    let harness = harness(client, RetrieverBehavior::Snippets(vec!["context"]));

    let response = harness
        .pipeline
        .ask("list temperature profiles")
        .await
        .expect("ask should succeed");

    assert_eq!(harness.client.requests_for(SYNTH_MODEL).len(), 2);
    assert_eq!(response.query_source, Some(QuerySource::Synthesized));
}

#[tokio::test]
async fn unavailable_index_degrades_to_empty_context() {
    let client = ScriptedClient::default()
        .reply(SYNTH_MODEL, Ok("SELECT PLATFORM_NUMBER, TEMP FROM profiles"));
    let harness = harness(client, RetrieverBehavior::Unavailable);

    let response = harness
        .pipeline
        .ask("list temperature profiles")
        .await
        .expect("ask should succeed without context");

    assert!(response.context.is_empty());
    assert!(
        response
            .notes
            .iter()
            .any(|note| note.contains("continuing without context"))
    );
    assert!(matches!(response.narration, Some(Narration::Declined { .. })));
    assert!(harness.client.requests_for(NARRATE_MODEL).is_empty());
    assert!(response.failures.is_empty());
}

#[tokio::test]
async fn stalled_index_times_out() {
    let client = ScriptedClient::default()
        .reply(SYNTH_MODEL, Ok("SELECT PLATFORM_NUMBER, TEMP FROM profiles"));
    let harness = harness(client, RetrieverBehavior::Stalled);

    let response = harness
        .pipeline
        .ask("list temperature profiles")
        .await
        .expect("ask should succeed without context");

    assert!(response.context.is_empty());
    assert!(response.notes.iter().any(|note| note.contains("timed out")));
}

#[tokio::test]
async fn missing_store_is_an_execution_failure() {
    let client = ScriptedClient::default()
        .reply(SYNTH_MODEL, Ok("SELECT PLATFORM_NUMBER, TEMP FROM profiles"))
        .reply(NARRATE_MODEL, Ok("Profiles are listed."));
    let descriptor = Arc::new(SchemaDescriptor::argo_profiles("profiles"));
    let missing = unique_temp_dir("floatchat-missing").join("absent.db");
    let harness = harness_with_store(
        client,
        RetrieverBehavior::Snippets(vec!["context"]),
        descriptor,
        missing,
        Duration::from_secs(5),
    );

    let response = harness
        .pipeline
        .ask("list temperature profiles")
        .await
        .expect("narration still stands");

    assert_eq!(response.failures.len(), 1);
    assert_eq!(response.failures[0].code, "execution_error");
    assert!(response.validated_query.is_some());
    assert!(response.result_table.is_none());
}

#[tokio::test]
async fn blank_question_is_rejected_up_front() {
    let harness = harness(ScriptedClient::default(), RetrieverBehavior::Snippets(Vec::new()));

    let error = harness
        .pipeline
        .ask("   ")
        .await
        .expect_err("blank question");
    assert_eq!(error, PipelineError::EmptyQuestion);
    assert!(harness.client.requests.lock().expect("requests lock").is_empty());
}
