// AI content generation on top of a chat-completion transport

mod error;

pub use error::GenerationError;

use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ChatCompletionRequest, ChatMessage, CompletionTransport, TransportError};
use crate::chapters::{Chapter, ChapterFormatter};
use crate::models::AppConfig;
use crate::session::{GenerationSession, SessionState};

/// Stand-in sent when the user left an input or instruction blank.
pub const PLACEHOLDER_CONTENT: &str = "none";

/// Supplies the API key at request time.
#[cfg_attr(test, mockall::automock)]
pub trait CredentialResolver: Send + Sync {
    fn resolve(&self) -> anyhow::Result<Option<String>>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateOptions {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub disable_system_prompt: bool,
}

impl GenerateOptions {
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationDefaults {
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl From<&AppConfig> for GenerationDefaults {
    fn from(config: &AppConfig) -> Self {
        Self {
            model: config.default_model.clone(),
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
        }
    }
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

#[derive(Clone)]
pub struct Generator {
    credentials: Arc<dyn CredentialResolver>,
    transport: Arc<dyn CompletionTransport>,
    defaults: GenerationDefaults,
}

impl Generator {
    pub fn new(
        credentials: Arc<dyn CredentialResolver>,
        transport: Arc<dyn CompletionTransport>,
        defaults: GenerationDefaults,
    ) -> Self {
        Self {
            credentials,
            transport,
            defaults,
        }
    }

    pub fn build_request(&self, content: &str, options: &GenerateOptions, stream: bool) -> ChatCompletionRequest {
        let mut messages = Vec::with_capacity(2);
        if !options.disable_system_prompt {
            if let Some(system) = options.system_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
                messages.push(ChatMessage::system(system));
            }
        }
        messages.push(ChatMessage::user(content));

        ChatCompletionRequest {
            model: options.model.clone().unwrap_or_else(|| self.defaults.model.clone()),
            messages,
            temperature: options.temperature.unwrap_or(self.defaults.temperature),
            max_tokens: options.max_output_tokens.unwrap_or(self.defaults.max_output_tokens),
            stream,
        }
    }

    fn api_key(&self) -> Result<String, GenerationError> {
        match self.credentials.resolve() {
            Ok(Some(key)) if !key.trim().is_empty() => Ok(key),
            Ok(_) => Err(GenerationError::Configuration),
            Err(e) => {
                warn!(error = %e, "failed to read API key");
                Err(GenerationError::Configuration)
            }
        }
    }

    /// Generate a complete response in one round trip.
    pub async fn generate(&self, content: &str, options: &GenerateOptions) -> Result<String, GenerationError> {
        if content.is_empty() {
            return Ok(String::new());
        }
        let api_key = self.api_key()?;
        let request = self.build_request(content, options, false);
        info!(model = %request.model, max_tokens = request.max_tokens, "generating");

        let response = self
            .transport
            .complete(&api_key, &request)
            .await
            .map_err(|e| {
                warn!(error = %e, "generation failed");
                GenerationError::from_transport(&e)
            })?;

        Ok(response.text().to_string())
    }

    /// Stream a response, handing each fragment to `on_fragment` as it arrives.
    ///
    /// The session's token is raced against every network wait and checked
    /// before each fragment is dispatched; once it fires no further fragment is
    /// delivered, the response body is dropped and `Cancelled` is returned.
    pub async fn generate_stream<F>(
        &self,
        content: &str,
        options: &GenerateOptions,
        session: &GenerationSession,
        mut on_fragment: F,
    ) -> Result<(), GenerationError>
    where
        F: FnMut(&str),
    {
        if session.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }
        if session.state() != SessionState::Idle {
            return Err(GenerationError::Unknown(format!("session {} was already used", session.id())));
        }
        if content.is_empty() {
            session.transition(SessionState::Completed);
            return Ok(());
        }

        let api_key = match self.api_key() {
            Ok(key) => key,
            Err(e) => {
                session.transition(SessionState::Failed);
                return Err(e);
            }
        };
        if !session.start() {
            return Err(GenerationError::Cancelled);
        }

        let request = self.build_request(content, options, true);
        info!(session = %session.id(), model = %request.model, max_tokens = request.max_tokens, "streaming generation");

        let result = self
            .drive_stream(&api_key, &request, session, &mut on_fragment)
            .await;

        match &result {
            Ok(()) => {
                session.transition(SessionState::Completed);
                debug!(session = %session.id(), "generation completed");
            }
            Err(GenerationError::Cancelled) => {
                session.transition(SessionState::Cancelled);
                info!(session = %session.id(), "generation cancelled");
            }
            Err(e) => {
                session.transition(SessionState::Failed);
                warn!(session = %session.id(), error = %e, "generation failed");
            }
        }
        result
    }

    async fn drive_stream<F>(
        &self,
        api_key: &str,
        request: &ChatCompletionRequest,
        session: &GenerationSession,
        on_fragment: &mut F,
    ) -> Result<(), GenerationError>
    where
        F: FnMut(&str),
    {
        let token = session.token();

        let mut stream = tokio::select! {
            biased;
            () = token.cancelled() => return Err(GenerationError::Cancelled),
            opened = self.transport.complete_stream(api_key, request) => {
                opened.map_err(|e| classify(token, &e))?
            }
        };
        session.transition(SessionState::Streaming);

        loop {
            let next = tokio::select! {
                biased;
                () = token.cancelled() => return Err(GenerationError::Cancelled),
                next = stream.next() => next,
            };
            let Some(item) = next else {
                return Ok(());
            };
            let chunk = item.map_err(|e| classify(token, &e))?;

            if token.is_cancelled() {
                return Err(GenerationError::Cancelled);
            }
            let fragment = chunk.fragment();
            if !fragment.is_empty() {
                on_fragment(fragment);
            }
        }
    }

    /// Format the selected chapters behind `prompt` and generate in one go.
    pub async fn analyze(
        &self,
        chapters: &[Chapter],
        selected: &[usize],
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String, GenerationError> {
        let content = ChapterFormatter::format_prompt(chapters, selected, prompt);
        self.generate(&content, options).await
    }

    pub async fn analyze_stream<F>(
        &self,
        chapters: &[Chapter],
        selected: &[usize],
        prompt: &str,
        options: &GenerateOptions,
        session: &GenerationSession,
        on_fragment: F,
    ) -> Result<(), GenerationError>
    where
        F: FnMut(&str),
    {
        let content = ChapterFormatter::format_prompt(chapters, selected, prompt);
        self.generate_stream(&content, options, session, on_fragment).await
    }
}

/// A transport failure that races a cancellation is reported as the cancellation.
fn classify(token: &CancellationToken, error: &TransportError) -> GenerationError {
    if token.is_cancelled() {
        GenerationError::Cancelled
    } else {
        GenerationError::from_transport(error)
    }
}

/// Content and options for a creative-map tool: the instruction goes in as the
/// system prompt and blanks are replaced by [`PLACEHOLDER_CONTENT`].
pub fn creative_request(user_input: &str, instruction: &str) -> (String, GenerateOptions) {
    let or_placeholder = |value: &str| {
        if value.trim().is_empty() {
            PLACEHOLDER_CONTENT.to_string()
        } else {
            value.to_string()
        }
    };
    let options = GenerateOptions::default().with_system_prompt(or_placeholder(instruction));
    (or_placeholder(user_input), options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ChatCompletionChunk, ChatCompletionResponse, ChunkStream, Role};
    use crate::slots::{SlotRegistry, SLOT_WRITING};
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn chunk(fragment: &str) -> ChatCompletionChunk {
        serde_json::from_value(serde_json::json!({ "choices": [{ "delta": { "content": fragment } }] })).unwrap()
    }

    #[derive(Default)]
    struct FakeTransport {
        calls: AtomicUsize,
        requests: Mutex<Vec<ChatCompletionRequest>>,
        reply: String,
        fragments: Vec<String>,
        hang_after_fragments: bool,
        failure: Option<fn() -> TransportError>,
    }

    impl FakeTransport {
        fn replying(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                ..Self::default()
            }
        }

        fn streaming(fragments: &[&str]) -> Self {
            Self {
                fragments: fragments.iter().map(ToString::to_string).collect(),
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn last_request(&self) -> ChatCompletionRequest {
            self.requests.lock().unwrap().last().cloned().unwrap()
        }

        fn record(&self, request: &ChatCompletionRequest) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
        }
    }

    impl CompletionTransport for FakeTransport {
        fn complete<'a>(
            &'a self,
            _api_key: &'a str,
            request: &'a ChatCompletionRequest,
        ) -> BoxFuture<'a, Result<ChatCompletionResponse, TransportError>> {
            self.record(request);
            Box::pin(async move {
                if let Some(failure) = self.failure {
                    return Err(failure());
                }
                Ok(serde_json::from_value(serde_json::json!({
                    "choices": [{ "message": { "content": self.reply } }]
                }))
                .unwrap())
            })
        }

        fn complete_stream<'a>(
            &'a self,
            _api_key: &'a str,
            request: &'a ChatCompletionRequest,
        ) -> BoxFuture<'a, Result<ChunkStream, TransportError>> {
            self.record(request);
            Box::pin(async move {
                if let Some(failure) = self.failure {
                    return Err(failure());
                }
                let chunks: Vec<Result<ChatCompletionChunk, TransportError>> =
                    self.fragments.iter().map(|f| Ok(chunk(f))).collect();
                let stream: ChunkStream = if self.hang_after_fragments {
                    Box::pin(futures::stream::iter(chunks).chain(futures::stream::pending()))
                } else {
                    Box::pin(futures::stream::iter(chunks))
                };
                Ok(stream)
            })
        }
    }

    fn with_key() -> Arc<dyn CredentialResolver> {
        let mut resolver = MockCredentialResolver::new();
        resolver.expect_resolve().returning(|| Ok(Some("sk-test".to_string())));
        Arc::new(resolver)
    }

    fn without_key() -> Arc<dyn CredentialResolver> {
        let mut resolver = MockCredentialResolver::new();
        resolver.expect_resolve().times(1).returning(|| Ok(None));
        Arc::new(resolver)
    }

    fn generator(credentials: Arc<dyn CredentialResolver>, transport: &Arc<FakeTransport>) -> Generator {
        Generator::new(credentials, transport.clone(), GenerationDefaults::default())
    }

    #[tokio::test]
    async fn test_generate_returns_text_with_defaults() {
        let transport = Arc::new(FakeTransport::replying("生成的文字"));
        let generator = generator(with_key(), &transport);

        let text = generator.generate("写一段开头", &GenerateOptions::default()).await.unwrap();
        assert_eq!(text, "生成的文字");

        let request = transport.last_request();
        assert_eq!(request.model, crate::models::MODEL_FAST);
        assert!((request.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(request.max_tokens, 64_000);
        assert!(!request.stream);
    }

    #[tokio::test]
    async fn test_generate_without_key_makes_no_call() {
        let transport = Arc::new(FakeTransport::replying("unused"));
        let generator = generator(without_key(), &transport);

        let err = generator.generate("hello", &GenerateOptions::default()).await.unwrap_err();
        assert_eq!(err, GenerationError::Configuration);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_stream_without_key_makes_no_call() {
        let transport = Arc::new(FakeTransport::streaming(&["a"]));
        let generator = generator(without_key(), &transport);
        let session = GenerationSession::new();

        let err = generator
            .generate_stream("hello", &GenerateOptions::default(), &session, |_| panic!("no fragments"))
            .await
            .unwrap_err();
        assert_eq!(err, GenerationError::Configuration);
        assert_eq!(transport.calls(), 0);
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_blank_key_is_configuration_error() {
        let mut resolver = MockCredentialResolver::new();
        resolver.expect_resolve().returning(|| Ok(Some("   ".to_string())));
        let transport = Arc::new(FakeTransport::replying("unused"));
        let generator = generator(Arc::new(resolver), &transport);

        let err = generator.generate("hello", &GenerateOptions::default()).await.unwrap_err();
        assert_eq!(err, GenerationError::Configuration);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_resolver_failure_is_configuration_error() {
        let mut resolver = MockCredentialResolver::new();
        resolver
            .expect_resolve()
            .returning(|| Err(anyhow::anyhow!("settings unreadable")));
        let transport = Arc::new(FakeTransport::replying("unused"));
        let generator = generator(Arc::new(resolver), &transport);

        let err = generator.generate("hello", &GenerateOptions::default()).await.unwrap_err();
        assert_eq!(err, GenerationError::Configuration);
    }

    #[tokio::test]
    async fn test_empty_content_short_circuits() {
        let transport = Arc::new(FakeTransport::replying("unused"));
        let mut resolver = MockCredentialResolver::new();
        resolver.expect_resolve().never();
        let generator = generator(Arc::new(resolver), &transport);

        assert_eq!(generator.generate("", &GenerateOptions::default()).await.unwrap(), "");
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_system_prompt_included_when_present() {
        let transport = Arc::new(FakeTransport::replying("ok"));
        let generator = generator(with_key(), &transport);
        let options = GenerateOptions::default().with_system_prompt("你是一位小说编辑");

        generator.generate("hi", &options).await.unwrap();
        let request = transport.last_request();
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(request.messages[0].content, "你是一位小说编辑");
        assert_eq!(request.messages[1], ChatMessage::user("hi"));
    }

    #[tokio::test]
    async fn test_blank_system_prompt_omitted() {
        let transport = Arc::new(FakeTransport::streaming(&["x"]));
        let generator = generator(with_key(), &transport);
        let options = GenerateOptions::default().with_system_prompt(" \n\t ");

        let session = GenerationSession::new();
        generator
            .generate_stream("hi", &options, &session, |_| {})
            .await
            .unwrap();
        let request = transport.last_request();
        assert_eq!(request.messages, vec![ChatMessage::user("hi")]);
        assert!(request.stream);
    }

    #[tokio::test]
    async fn test_disable_system_prompt_wins() {
        let transport = Arc::new(FakeTransport::replying("ok"));
        let generator = generator(with_key(), &transport);
        let options = GenerateOptions {
            system_prompt: Some("instruction".to_string()),
            disable_system_prompt: true,
            ..GenerateOptions::default()
        };

        generator.generate("hi", &options).await.unwrap();
        assert!(transport.last_request().messages.iter().all(|m| m.role != Role::System));
    }

    #[tokio::test]
    async fn test_options_override_defaults() {
        let transport = Arc::new(FakeTransport::replying("ok"));
        let generator = generator(with_key(), &transport);
        let options = GenerateOptions {
            model: Some(crate::models::MODEL_PRO.to_string()),
            temperature: Some(1.1),
            max_output_tokens: Some(2048),
            ..GenerateOptions::default()
        };

        generator.generate("hi", &options).await.unwrap();
        let request = transport.last_request();
        assert_eq!(request.model, crate::models::MODEL_PRO);
        assert_eq!(request.max_tokens, 2048);
        assert!((request.temperature - 1.1).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_stream_delivers_fragments_in_order() {
        let transport = Arc::new(FakeTransport::streaming(&["风", "", "起", "了"]));
        let generator = generator(with_key(), &transport);
        let session = GenerationSession::new();

        let mut fragments = Vec::new();
        generator
            .generate_stream("go", &GenerateOptions::default(), &session, |f| fragments.push(f.to_string()))
            .await
            .unwrap();

        assert_eq!(fragments, vec!["风", "起", "了"]);
        assert_eq!(session.state(), SessionState::Completed);
    }

    #[tokio::test]
    async fn test_cancel_from_callback_stops_buffered_fragments() {
        let transport = Arc::new(FakeTransport::streaming(&["one", "two", "three"]));
        let generator = generator(with_key(), &transport);
        let session = GenerationSession::new();

        let mut fragments = Vec::new();
        let err = generator
            .generate_stream("go", &GenerateOptions::default(), &session, |f| {
                fragments.push(f.to_string());
                session.cancel();
            })
            .await
            .unwrap_err();

        assert_eq!(err, GenerationError::Cancelled);
        assert_eq!(fragments, vec!["one"]);
        assert_eq!(session.state(), SessionState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_on_network() {
        let transport = Arc::new(FakeTransport {
            hang_after_fragments: true,
            ..FakeTransport::streaming(&["first"])
        });
        let generator = generator(with_key(), &transport);
        let session = Arc::new(GenerationSession::new());

        let canceller = {
            let session = session.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                session.cancel();
            })
        };

        let mut fragments = Vec::new();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            generator.generate_stream("go", &GenerateOptions::default(), &session, |f| {
                fragments.push(f.to_string());
            }),
        )
        .await
        .expect("cancellation should end the stream promptly");

        canceller.await.unwrap();
        assert_eq!(result, Err(GenerationError::Cancelled));
        assert_eq!(fragments, vec!["first"]);
    }

    #[tokio::test]
    async fn test_new_slot_session_cancels_in_flight_stream() {
        let transport = Arc::new(FakeTransport {
            hang_after_fragments: true,
            ..FakeTransport::streaming(&["first"])
        });
        let generator = generator(with_key(), &transport);
        let slots = SlotRegistry::new(Duration::from_millis(10));

        let first = slots.begin(SLOT_WRITING).await;
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let running = {
            let generator = generator.clone();
            let first = first.clone();
            tokio::spawn(async move {
                let mut started = Some(started_tx);
                generator
                    .generate_stream("go", &GenerateOptions::default(), &first, move |_| {
                        if let Some(tx) = started.take() {
                            let _ = tx.send(());
                        }
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        let second = slots.begin(SLOT_WRITING).await;
        assert!(first.is_cancelled());
        assert_eq!(transport.calls(), 1, "second request not issued yet");

        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("in-flight stream should stop once cancelled")
            .unwrap();
        assert_eq!(result, Err(GenerationError::Cancelled));
        assert_eq!(first.state(), SessionState::Cancelled);
        assert_eq!(second.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_already_cancelled_session_makes_no_call() {
        let transport = Arc::new(FakeTransport::streaming(&["a"]));
        let generator = generator(with_key(), &transport);
        let session = GenerationSession::new();
        session.cancel();

        let err = generator
            .generate_stream("go", &GenerateOptions::default(), &session, |_| {})
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_session_cannot_be_reused() {
        let transport = Arc::new(FakeTransport::streaming(&["a"]));
        let generator = generator(with_key(), &transport);
        let session = GenerationSession::new();

        generator
            .generate_stream("go", &GenerateOptions::default(), &session, |_| {})
            .await
            .unwrap();
        let err = generator
            .generate_stream("again", &GenerateOptions::default(), &session, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Unknown(_)));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_is_classified() {
        let transport = Arc::new(FakeTransport {
            failure: Some(|| TransportError::Status {
                status: 401,
                body: "No auth credentials found".to_string(),
            }),
            ..FakeTransport::default()
        });
        let generator = generator(with_key(), &transport);
        let session = GenerationSession::new();

        let err = generator
            .generate_stream("go", &GenerateOptions::default(), &session, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Authentication(_)));
        assert_eq!(session.state(), SessionState::Failed);

        let err = generator.generate("go", &GenerateOptions::default()).await.unwrap_err();
        assert!(matches!(err, GenerationError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_analyze_sends_formatted_chapters() {
        let transport = Arc::new(FakeTransport::replying("分析结果"));
        let generator = generator(with_key(), &transport);
        let chapters = vec![Chapter::new("第一章", "甲"), Chapter::new("第二章", "乙")];

        let result = generator
            .analyze(&chapters, &[1], "分析节奏", &GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(result, "分析结果");

        let request = transport.last_request();
        let user = &request.messages.last().unwrap().content;
        assert!(user.starts_with("分析节奏\n\n===== 章节内容 ====="));
        assert!(user.contains("# 第二章\n\n乙"));
        assert!(!user.contains("第一章"));
    }

    #[tokio::test]
    async fn test_analyze_stream_uses_selected_chapters() {
        let transport = Arc::new(FakeTransport::streaming(&["节奏", "偏慢"]));
        let generator = generator(with_key(), &transport);
        let chapters = vec![Chapter::new("第一章", "甲"), Chapter::new("第二章", "乙")];
        let session = GenerationSession::new();

        let mut result = String::new();
        generator
            .analyze_stream(&chapters, &[0], "分析节奏", &GenerateOptions::default(), &session, |f| {
                result.push_str(f);
            })
            .await
            .unwrap();

        assert_eq!(result, "节奏偏慢");
        let request = transport.last_request();
        let user = &request.messages.last().unwrap().content;
        assert!(user.contains("# 第一章\n\n甲"));
        assert!(!user.contains("第二章"));
    }

    #[test]
    fn test_creative_request_placeholders() {
        let (content, options) = creative_request("  ", "");
        assert_eq!(content, PLACEHOLDER_CONTENT);
        assert_eq!(options.system_prompt.as_deref(), Some(PLACEHOLDER_CONTENT));

        let (content, options) = creative_request("一个侦探", "设计角色");
        assert_eq!(content, "一个侦探");
        assert_eq!(options.system_prompt.as_deref(), Some("设计角色"));
    }
}
