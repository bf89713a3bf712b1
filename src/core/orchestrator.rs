//! 对话编排器：每条玩家消息走一遍状态机
//!
//! LOAD_MEMORY → MATCH_INPUT_TRIGGERS → CLASSIFY → (RETRIEVE | SKIP_RETRIEVAL) → BUILD_CONTEXT
//! → GENERATE → MATCH_OUTPUT_TRIGGERS → UPDATE_MEMORY → DONE，任一步失败进入 FAILED。
//!
//! 会话锁从 LOAD_MEMORY 一直持有到 UPDATE_MEMORY 结束，同一会话的消息因此按到达顺序串行；
//! 生成失败时记忆不做任何修改。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::character::{CharacterCatalog, CharacterContext, CharacterSource};
use crate::config::AppConfig;
use crate::core::action::parse_actions;
use crate::core::error::{CompletionError, TurnError};
use crate::core::prompt::{ContextBuilder, ContextInputs};
use crate::core::registry::{SessionHandle, SessionRegistry};
use crate::core::state::{PhaseTracker, RetrievalReport, TurnOutcome, TurnPhase};
use crate::knowledge::{self, merge_passages, KnowledgeRetriever, Passage, Scope, SimilarityIndex};
use crate::llm::{
    create_deepseek_completion, detect_intent, CompletionOptions, CompletionService, Complexity,
    ComplexityClassifier, HeuristicClassifier, MockCompletion, ModelClassifier, OpenAiCompletion,
};
use crate::memory::{
    InMemoryPersistence, JsonFilePersistence, MemoryContext, MemoryPersistence, MemoryState, MemoryStats,
    MemoryStore, MemoryStoreConfig, Turn,
};
use crate::triggers::{match_triggers, Direction, OverlapScorer, TriggerScorer};

/// 会话被并发驱逐时重新获取 handle 的次数上限
const MAX_ACQUIRE_ATTEMPTS: usize = 3;

/// 玩家信息（由游戏层传入）
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerData {
    pub player_id: String,
    /// 显示名，写入角色设定段
    #[serde(default)]
    pub name: Option<String>,
    /// 游戏状态（声望、物品、任务进度……），供触发条件读取
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl PlayerData {
    pub fn new(player_id: impl Into<String>) -> Self {
        Self {
            player_id: player_id.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_attribute(key, value);
        self
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// 触发条件看到的玩家对象：attributes 加上 `id` 与 `name`
    pub fn facts(&self) -> Value {
        let mut facts = self.attributes.clone();
        facts.insert("id".to_string(), Value::from(self.player_id.clone()));
        if let Some(name) = &self.name {
            facts.insert("name".to_string(), Value::from(name.clone()));
        }
        Value::Object(facts)
    }
}

/// 触发条件求值用的数据：`{"player": ..., "character": ...}`
fn trigger_facts(player: &PlayerData, character: &CharacterContext) -> Value {
    json!({
        "player": player.facts(),
        "character": {
            "id": character.id,
            "name": character.name,
            "personality": character.personality,
        },
    })
}

/// 不跑一轮对话、直接查看会话记忆
#[derive(Clone, Debug, Serialize)]
pub struct ConversationHistory {
    pub session_id: String,
    pub character_id: String,
    pub context: MemoryContext,
    pub stats: MemoryStats,
}

/// 每轮使用的参数（来自 AppConfig）
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub max_summaries: usize,
    pub top_k_world: usize,
    pub top_k_character: usize,
    pub passage_budget: usize,
    pub min_relevance: f32,
    pub generation_timeout: Duration,
    pub evict_on_farewell: bool,
    pub options: CompletionOptions,
}

impl TurnSettings {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            max_summaries: config.memory.max_summaries_in_context,
            top_k_world: config.retrieval.top_k_world,
            top_k_character: config.retrieval.top_k_character,
            passage_budget: config.retrieval.passage_budget,
            min_relevance: config.retrieval.min_relevance,
            generation_timeout: config.llm.generation_timeout(),
            evict_on_farewell: config.session.evict_on_farewell,
            options: CompletionOptions {
                temperature: config.llm.temperature,
                max_tokens: config.llm.max_tokens,
            },
        }
    }
}

/// 对话编排器
pub struct Orchestrator {
    registry: Arc<SessionRegistry>,
    characters: Arc<dyn CharacterSource>,
    store: MemoryStore,
    classifier: Arc<dyn ComplexityClassifier>,
    retriever: KnowledgeRetriever,
    completion: Arc<dyn CompletionService>,
    scorer: Arc<dyn TriggerScorer>,
    context_builder: ContextBuilder,
    settings: TurnSettings,
}

impl Orchestrator {
    /// 用显式注入的各项能力构建编排器；注册表为新建的空表
    pub fn new(
        config: &AppConfig,
        completion: Arc<dyn CompletionService>,
        persistence: Arc<dyn MemoryPersistence>,
        characters: Arc<dyn CharacterSource>,
        index: Arc<dyn SimilarityIndex>,
        classifier: Arc<dyn ComplexityClassifier>,
    ) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            characters,
            store: MemoryStore::new(MemoryStoreConfig::from_app(config), completion.clone(), persistence),
            classifier,
            retriever: KnowledgeRetriever::new(index, config.retrieval.timeout()),
            completion,
            scorer: Arc::new(OverlapScorer),
            context_builder: ContextBuilder::new(config.prompt.token_budget),
            settings: TurnSettings::from_app(config),
        }
    }

    /// 替换触发器打分器（例如语义相似度）
    pub fn with_scorer(mut self, scorer: Arc<dyn TriggerScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &TurnSettings {
        &self.settings
    }

    pub fn completion_name(&self) -> &str {
        self.completion.name()
    }

    /// 处理一条玩家消息
    pub async fn process_message(
        &self,
        user_message: &str,
        character_id: &str,
        player: &PlayerData,
        session_id: &str,
    ) -> Result<TurnOutcome, TurnError> {
        let mut tracker = PhaseTracker::new(session_id, character_id);

        // LOAD_MEMORY
        tracker.enter(TurnPhase::LoadMemory);
        let character = self.characters.load(character_id).await.map_err(|e| {
            warn!(session_id, character_id, error = %e, "cannot create session");
            TurnError::from(e)
        })?;
        let (handle, mut guard, created) = self.acquire(session_id, &character, player).await?;
        tracker.diagnostics.session_created = created;
        let state = match guard.take() {
            Some(state) => state,
            None => self
                .store
                .restore(session_id, &character.id, &player.player_id)
                .await?,
        };
        let state = guard.insert(state);

        // MATCH_INPUT_TRIGGERS
        tracker.enter(TurnPhase::MatchInputTriggers);
        tracker.diagnostics.user_actions = parse_actions(user_message).actions;
        let facts = trigger_facts(player, &character);
        let input = match_triggers(
            self.scorer.as_ref(),
            user_message,
            &character.triggers,
            Direction::Input,
            &facts,
        );
        let input_triggers = input.matched;
        tracker.diagnostics.refused_triggers = input.refused;

        // CLASSIFY
        tracker.enter(TurnPhase::Classify);
        let memory_context = self.store.read_context(state, self.settings.max_summaries);
        let intent = detect_intent(user_message);
        let complexity = self.classifier.classify(user_message, &memory_context).await;
        tracker.diagnostics.intent = Some(intent);
        tracker.diagnostics.classification = Some(complexity);
        debug!(session_id, ?intent, ?complexity, classifier = self.classifier.name(), "message classified");

        // RETRIEVE | SKIP_RETRIEVAL
        let passages = if complexity == Complexity::NeedsKnowledge {
            tracker.enter(TurnPhase::Retrieve);
            let (passages, report) = self.retrieve(user_message, &character.id).await;
            tracker.diagnostics.retrieval = Some(report);
            passages
        } else {
            tracker.enter(TurnPhase::SkipRetrieval);
            Vec::new()
        };

        // BUILD_CONTEXT
        tracker.enter(TurnPhase::BuildContext);
        let secrets = character.revealable_secrets(&input_triggers);
        let (prompt, prompt_tokens) = self.context_builder.build(&ContextInputs {
            character: &character,
            memory: &memory_context,
            passages: &passages,
            input_triggers: &input_triggers,
            secrets: &secrets,
            player_name: player.name.as_deref(),
            user_message,
        });
        tracker.diagnostics.prompt_tokens_estimate = prompt_tokens;
        tracker.diagnostics.passages = passages;

        // GENERATE
        tracker.enter(TurnPhase::Generate);
        let generated = tokio::time::timeout(
            self.settings.generation_timeout,
            self.completion.complete(&prompt, &self.settings.options),
        )
        .await;
        let response = match generated {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => return Err(Self::fail(tracker, e.to_string(), Some(e))),
            Err(_) => {
                return Err(Self::fail(
                    tracker,
                    format!("generation timed out after {:?}", self.settings.generation_timeout),
                    None,
                ))
            }
        };

        // MATCH_OUTPUT_TRIGGERS
        tracker.enter(TurnPhase::MatchOutputTriggers);
        let response_parsed = parse_actions(&response);
        tracker.diagnostics.response_actions = response_parsed.actions.clone();
        let output = match_triggers(
            self.scorer.as_ref(),
            &response,
            &character.triggers,
            Direction::Output,
            &facts,
        );
        let output_triggers = output.matched;
        tracker.diagnostics.refused_triggers.extend(output.refused);

        // UPDATE_MEMORY
        tracker.enter(TurnPhase::UpdateMemory);
        let mut termination_cue = None;
        for turn in [
            Turn::user(session_id, user_message),
            Turn::character(session_id, response.clone()),
        ] {
            let outcome = self.store.append(state, turn).await?;
            tracker.diagnostics.compactions.extend(outcome.compaction);
            termination_cue = termination_cue.or(outcome.termination_cue);
        }
        let memory_stats = state.stats();
        handle.touch();

        let evict = termination_cue.is_some() && self.settings.evict_on_farewell;
        tracker.diagnostics.termination_cue = termination_cue;
        tracker.diagnostics.evicted = evict;
        let diagnostics = tracker.finish(TurnPhase::Done);
        drop(guard);

        info!(
            session_id,
            character_id,
            total_turn_count = memory_stats.total_turn_count,
            input_triggers = input_triggers.len(),
            output_triggers = output_triggers.len(),
            total_ms = diagnostics.total_ms,
            "turn completed"
        );

        if evict {
            self.registry.evict(session_id).await;
        }

        Ok(TurnOutcome {
            session_id: session_id.to_string(),
            response,
            response_parsed,
            input_triggers,
            output_triggers,
            memory_stats,
            diagnostics,
        })
    }

    /// 取得会话 handle 并加锁；拿到锁后发现已被驱逐则重新获取
    async fn acquire(
        &self,
        session_id: &str,
        character: &CharacterContext,
        player: &PlayerData,
    ) -> Result<(Arc<SessionHandle>, OwnedMutexGuard<Option<MemoryState>>, bool), TurnError> {
        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            let (handle, created) = self
                .registry
                .get_or_create(session_id, &character.id, &player.player_id)
                .await;
            if handle.character_id != character.id {
                return Err(TurnError::InvalidSession(format!(
                    "{} is bound to character {}",
                    session_id, handle.character_id
                )));
            }
            let guard = handle.lock().await;
            if handle.is_closed() {
                debug!(session_id, "session evicted while waiting for lock, retrying");
                continue;
            }
            return Ok((handle, guard, created));
        }
        Err(TurnError::InvalidSession(format!("{} keeps being evicted", session_id)))
    }

    /// 世界与角色两个范围并发检索；单个范围失败只降级为空结果
    async fn retrieve(&self, query: &str, character_id: &str) -> (Vec<Passage>, RetrievalReport) {
        let world_scope = Scope::World;
        let character_scope = Scope::Character(character_id.to_string());
        let (world, personal) = futures_util::future::join(
            self.retriever.retrieve(query, &world_scope, self.settings.top_k_world),
            self.retriever
                .retrieve(query, &character_scope, self.settings.top_k_character),
        )
        .await;

        let mut report = RetrievalReport::default();
        let world = world.unwrap_or_else(|e| {
            report.errors.push(e.to_string());
            Vec::new()
        });
        let personal = personal.unwrap_or_else(|e| {
            report.errors.push(e.to_string());
            Vec::new()
        });
        report.world_hits = world.len();
        report.character_hits = personal.len();

        let passages = merge_passages(
            world,
            personal,
            self.settings.min_relevance,
            self.settings.passage_budget,
        );
        (passages, report)
    }

    fn fail(tracker: PhaseTracker, message: String, cause: Option<CompletionError>) -> TurnError {
        let diagnostics = tracker.finish(TurnPhase::Failed);
        warn!(
            session_id = %diagnostics.session_id,
            error = %message,
            transient = cause.as_ref().map_or(true, CompletionError::is_transient),
            "generation failed, memory left untouched"
        );
        TurnError::Generation {
            message,
            cause,
            diagnostics: Box::new(diagnostics),
        }
    }

    async fn live_session(&self, session_id: &str) -> Result<Arc<SessionHandle>, TurnError> {
        self.registry
            .get(session_id)
            .await
            .ok_or_else(|| TurnError::InvalidSession(session_id.to_string()))
    }

    /// 当前会话的摘要与最近消息；会话须在注册表中
    pub async fn history(&self, session_id: &str, max_summaries: usize) -> Result<ConversationHistory, TurnError> {
        let handle = self.live_session(session_id).await?;
        let guard = handle.lock().await;
        let Some(state) = guard.as_ref().filter(|s| !s.is_closed()) else {
            return Err(TurnError::InvalidSession(session_id.to_string()));
        };
        Ok(ConversationHistory {
            session_id: session_id.to_string(),
            character_id: state.character_id().to_string(),
            context: self.store.read_context(state, max_summaries),
            stats: state.stats(),
        })
    }

    /// 清空会话的原始消息（可选保留摘要）
    pub async fn clear_memory(&self, session_id: &str, keep_summaries: bool) -> Result<MemoryStats, TurnError> {
        let handle = self.live_session(session_id).await?;
        let mut guard = handle.lock().await;
        let Some(state) = guard.as_mut() else {
            return Err(TurnError::InvalidSession(session_id.to_string()));
        };
        self.store.clear(state, keep_summaries).await?;
        handle.touch();
        Ok(state.stats())
    }

    /// 显式结束会话
    pub async fn end_session(&self, session_id: &str) -> bool {
        self.registry.evict(session_id).await
    }

    pub async fn shutdown(&self) -> usize {
        self.registry.shutdown().await
    }
}

/// 按配置选择补全后端：deepseek / openai 需要对应 API key，否则回退 Mock
pub fn create_completion_from_config(config: &AppConfig) -> Arc<dyn CompletionService> {
    let provider = config.llm.provider.to_lowercase();
    let has_key = |name: &str| std::env::var(name).map(|v| !v.is_empty()).unwrap_or(false);

    match provider.as_str() {
        "deepseek" if has_key("DEEPSEEK_API_KEY") || has_key("OPENAI_API_KEY") => {
            let completion = create_deepseek_completion(config.llm.model.as_deref());
            info!(model = completion.model(), "using DeepSeek completion");
            Arc::new(completion)
        }
        "openai" if has_key("OPENAI_API_KEY") => {
            let model = config.llm.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());
            info!(model = %model, "using OpenAI-compatible completion");
            Arc::new(OpenAiCompletion::new(config.llm.base_url.as_deref(), &model, None))
        }
        "mock" => Arc::new(MockCompletion::new()),
        other => {
            warn!(provider = other, "no API key set or provider unknown, using mock completion");
            Arc::new(MockCompletion::new())
        }
    }
}

/// 按配置选择持久化后端
pub async fn create_persistence_from_config(config: &AppConfig) -> anyhow::Result<Arc<dyn MemoryPersistence>> {
    let path = &config.persistence.path;
    match config.persistence.backend.to_lowercase().as_str() {
        "json" => {
            info!(path = %path.display(), "using JSON file persistence");
            Ok(Arc::new(JsonFilePersistence::new(path)))
        }
        #[cfg(feature = "async-sqlite")]
        "sqlite" => {
            info!(path = %path.display(), "using SQLite persistence");
            Ok(Arc::new(crate::memory::SqlitePersistence::new(path).await?))
        }
        #[cfg(not(feature = "async-sqlite"))]
        "sqlite" => {
            warn!("sqlite persistence requires the async-sqlite feature, using in-memory store");
            Ok(Arc::new(InMemoryPersistence::new()))
        }
        "memory" => Ok(Arc::new(InMemoryPersistence::new())),
        other => {
            warn!(backend = other, "unknown persistence backend, using in-memory store");
            Ok(Arc::new(InMemoryPersistence::new()))
        }
    }
}

pub fn create_classifier_from_config(
    config: &AppConfig,
    completion: Arc<dyn CompletionService>,
) -> Arc<dyn ComplexityClassifier> {
    match config.classifier.mode.to_lowercase().as_str() {
        "model" => Arc::new(ModelClassifier::new(completion, config.llm.generation_timeout())),
        _ => Arc::new(HeuristicClassifier::new()),
    }
}

/// 从配置装配完整编排器：角色目录、知识索引、补全后端、持久化、分类器
pub async fn create_orchestrator(config: &AppConfig) -> anyhow::Result<Orchestrator> {
    let catalog = Arc::new(CharacterCatalog::open(config.app.data_dir.join("characters")));
    let index = knowledge::build_index(config, &catalog).await;
    let completion = create_completion_from_config(config);
    let persistence = create_persistence_from_config(config).await?;
    let classifier = create_classifier_from_config(config, completion.clone());

    info!(
        characters = catalog.available_ids().len(),
        completion = completion.name(),
        persistence = persistence.name(),
        classifier = classifier.name(),
        index = index.name(),
        "orchestrator ready"
    );

    Ok(Orchestrator::new(
        config,
        completion,
        persistence,
        catalog,
        index,
        classifier,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{Chunker, KeywordIndex};
    use crate::triggers::{TriggerDefinition, TriggerEffect};

    fn elara() -> CharacterContext {
        CharacterContext {
            id: "elara".into(),
            name: "Elara".into(),
            description: "Gardienne du phare.".into(),
            speech_style: "Douce".into(),
            personality: Default::default(),
            triggers: vec![TriggerDefinition {
                id: "phare".into(),
                direction: Direction::Input,
                match_terms: vec!["phare".into()],
                threshold: 0.5,
                conditions: vec![],
                effect: TriggerEffect::Emotion {
                    emotion: "nostalgique".into(),
                },
            }],
            secrets: vec![],
            knowledge: vec![],
        }
    }

    fn orchestrator(mock: Arc<MockCompletion>) -> Orchestrator {
        let config = AppConfig::default();
        Orchestrator::new(
            &config,
            mock,
            Arc::new(InMemoryPersistence::new()),
            Arc::new(CharacterCatalog::from_characters([elara()])),
            Arc::new(KeywordIndex::new(Chunker::default())),
            Arc::new(HeuristicClassifier::new()),
        )
    }

    #[tokio::test]
    async fn test_phases_recorded_in_order() {
        let orch = orchestrator(Arc::new(MockCompletion::new()));
        let outcome = orch
            .process_message("Bonjour", "elara", &PlayerData::new("p1"), "s1")
            .await
            .unwrap();

        let phases: Vec<_> = outcome.diagnostics.phases.iter().map(|p| p.phase).collect();
        assert_eq!(
            phases,
            vec![
                TurnPhase::LoadMemory,
                TurnPhase::MatchInputTriggers,
                TurnPhase::Classify,
                TurnPhase::SkipRetrieval,
                TurnPhase::BuildContext,
                TurnPhase::Generate,
                TurnPhase::MatchOutputTriggers,
                TurnPhase::UpdateMemory,
            ]
        );
        assert_eq!(outcome.diagnostics.terminal, Some(TurnPhase::Done));
        assert!(outcome.diagnostics.session_created);
    }

    #[tokio::test]
    async fn test_input_trigger_fires() {
        let orch = orchestrator(Arc::new(MockCompletion::new()));
        let outcome = orch
            .process_message("Le phare brille", "elara", &PlayerData::new("p1"), "s1")
            .await
            .unwrap();
        assert_eq!(outcome.input_triggers.len(), 1);
        assert_eq!(outcome.input_triggers[0].trigger_id, "phare");
        assert_eq!(outcome.fired_triggers().count(), 1);
    }

    #[tokio::test]
    async fn test_session_bound_to_other_character_is_rejected() {
        let orch = orchestrator(Arc::new(MockCompletion::new()));
        orch.registry().get_or_create("s1", "someone", "p1").await;
        let err = orch
            .process_message("Bonjour", "elara", &PlayerData::new("p1"), "s1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_session");
    }

    #[tokio::test]
    async fn test_history_and_clear_require_live_session() {
        let orch = orchestrator(Arc::new(MockCompletion::new()));
        assert_eq!(orch.history("nope", 5).await.unwrap_err().kind(), "invalid_session");
        assert_eq!(orch.clear_memory("nope", true).await.unwrap_err().kind(), "invalid_session");

        orch.process_message("Bonjour", "elara", &PlayerData::new("p1"), "s1")
            .await
            .unwrap();
        let history = orch.history("s1", 5).await.unwrap();
        assert_eq!(history.context.turns.len(), 2);
        assert_eq!(history.character_id, "elara");

        let stats = orch.clear_memory("s1", true).await.unwrap();
        assert_eq!(stats.recent_turns, 0);
        assert_eq!(stats.total_turn_count, 1);
    }

    #[tokio::test]
    async fn test_farewell_evicts_when_enabled() {
        let mut config = AppConfig::default();
        config.session.evict_on_farewell = true;
        let orch = Orchestrator::new(
            &config,
            Arc::new(MockCompletion::new()),
            Arc::new(InMemoryPersistence::new()),
            Arc::new(CharacterCatalog::from_characters([elara()])),
            Arc::new(KeywordIndex::new(Chunker::default())),
            Arc::new(HeuristicClassifier::new()),
        );

        let outcome = orch
            .process_message("Au revoir Elara", "elara", &PlayerData::new("p1"), "s1")
            .await
            .unwrap();
        assert_eq!(outcome.diagnostics.termination_cue.as_deref(), Some("au revoir"));
        assert!(outcome.diagnostics.evicted);
        assert!(orch.registry().get("s1").await.is_none());
    }

    #[test]
    fn test_trigger_facts_expose_player_and_character() {
        let player = PlayerData::new("p1")
            .with_name("Ael")
            .with_attribute("inventory", json!(["lanterne"]));
        let facts = trigger_facts(&player, &elara());
        assert_eq!(facts["player"]["id"], "p1");
        assert_eq!(facts["player"]["name"], "Ael");
        assert_eq!(facts["player"]["inventory"][0], "lanterne");
        assert_eq!(facts["character"]["id"], "elara");
    }

    #[test]
    fn test_unknown_provider_falls_back_to_mock() {
        let mut config = AppConfig::default();
        config.llm.provider = "nonexistent".into();
        assert_eq!(create_completion_from_config(&config).name(), "mock");
    }
}
