//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BARD__*` 覆盖（双下划线表示嵌套，如 `BARD__LLM__PROVIDER=openai`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub memory: MemorySection,
    pub retrieval: RetrievalSection,
    pub session: SessionSection,
    pub classifier: ClassifierSection,
    pub persistence: PersistenceSection,
    pub prompt: PromptSection,
}

/// [app] 段：应用名与数据目录
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 角色与世界观数据根目录（包含 characters/ 与 world/）
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            data_dir: default_data_dir(),
        }
    }
}

/// [llm] 段：后端选择、采样与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：mock / openai / deepseek
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// 生成超时（秒），超时即本轮失败
    #[serde(default = "default_generation_timeout")]
    pub generation_timeout_secs: u64,
    /// 摘要超时（秒），超时则推迟压缩
    #[serde(default = "default_summarization_timeout")]
    pub summarization_timeout_secs: u64,
    /// 嵌入模型；设置且有 API key 时使用向量检索
    pub embedding_model: Option<String>,
}

fn default_provider() -> String {
    "mock".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_generation_timeout() -> u64 {
    60
}

fn default_summarization_timeout() -> u64 {
    30
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            base_url: None,
            temperature: default_temperature(),
            max_tokens: None,
            generation_timeout_secs: default_generation_timeout(),
            summarization_timeout_secs: default_summarization_timeout(),
            embedding_model: None,
        }
    }
}

impl LlmSection {
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn summarization_timeout(&self) -> Duration {
        Duration::from_secs(self.summarization_timeout_secs)
    }
}

/// [memory] 段：窗口大小、压缩阈值与会话结束语
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    /// recent_turns 窗口（原始消息条数）
    #[serde(default = "default_keep_recent")]
    pub keep_recent_messages: usize,
    /// 距上次摘要多少轮交换后触发压缩
    #[serde(default = "default_max_without_summary")]
    pub max_messages_without_summary: u64,
    /// 提示词中最多带几条摘要
    #[serde(default = "default_max_summaries")]
    pub max_summaries_in_context: usize,
    /// 会话结束语：命中时立即压缩
    #[serde(default = "default_termination_cues")]
    pub termination_cues: Vec<String>,
}

fn default_keep_recent() -> usize {
    6
}

fn default_max_without_summary() -> u64 {
    10
}

fn default_max_summaries() -> usize {
    5
}

fn default_termination_cues() -> Vec<String> {
    vec![
        "bye".into(),
        "goodbye".into(),
        "au revoir".into(),
        "adieu".into(),
        "à bientôt".into(),
    ]
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            keep_recent_messages: default_keep_recent(),
            max_messages_without_summary: default_max_without_summary(),
            max_summaries_in_context: default_max_summaries(),
            termination_cues: default_termination_cues(),
        }
    }
}

/// [retrieval] 段：检索条数、段落预算、相关度阈值、超时与分块
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalSection {
    #[serde(default = "default_top_k_world")]
    pub top_k_world: usize,
    #[serde(default = "default_top_k_character")]
    pub top_k_character: usize,
    /// 合并后最多保留的段落数
    #[serde(default = "default_passage_budget")]
    pub passage_budget: usize,
    #[serde(default)]
    pub min_relevance: f32,
    #[serde(default = "default_retrieval_timeout")]
    pub timeout_secs: u64,
    /// 分块大小（字符）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

fn default_top_k_world() -> usize {
    3
}

fn default_top_k_character() -> usize {
    5
}

fn default_passage_budget() -> usize {
    5
}

fn default_retrieval_timeout() -> u64 {
    10
}

fn default_chunk_size() -> usize {
    300
}

fn default_chunk_overlap() -> usize {
    50
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            top_k_world: default_top_k_world(),
            top_k_character: default_top_k_character(),
            passage_budget: default_passage_budget(),
            min_relevance: 0.0,
            timeout_secs: default_retrieval_timeout(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

impl RetrievalSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// [session] 段：会话过期与清理
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    /// 无活动多少秒后被清理
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// 命中结束语后是否在本轮结束时驱逐会话
    #[serde(default)]
    pub evict_on_farewell: bool,
}

fn default_ttl() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    300
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            evict_on_farewell: false,
        }
    }
}

impl SessionSection {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// [classifier] 段：heuristic / model
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierSection {
    #[serde(default = "default_classifier_mode")]
    pub mode: String,
}

fn default_classifier_mode() -> String {
    "heuristic".to_string()
}

impl Default for ClassifierSection {
    fn default() -> Self {
        Self {
            mode: default_classifier_mode(),
        }
    }
}

/// [persistence] 段：memory / json / sqlite
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceSection {
    #[serde(default = "default_backend")]
    pub backend: String,
    /// json 为目录，sqlite 为数据库文件
    #[serde(default = "default_persistence_path")]
    pub path: PathBuf,
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_persistence_path() -> PathBuf {
    PathBuf::from("data/sessions")
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_persistence_path(),
        }
    }
}

/// [prompt] 段：系统提示的 token 预算
#[derive(Debug, Clone, Deserialize)]
pub struct PromptSection {
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
}

fn default_token_budget() -> usize {
    4000
}

impl Default for PromptSection {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 BARD__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BARD__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BARD")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.memory.keep_recent_messages, 6);
        assert_eq!(cfg.memory.max_messages_without_summary, 10);
        assert!(cfg.memory.termination_cues.iter().any(|c| c == "au revoir"));
        assert_eq!(cfg.retrieval.top_k_world, 3);
        assert_eq!(cfg.retrieval.top_k_character, 5);
        assert_eq!(cfg.llm.provider, "mock");
        assert_eq!(cfg.session.ttl(), Duration::from_secs(3600));
    }

    #[test]
    fn test_load_from_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bard.toml");
        std::fs::write(
            &path,
            "[memory]\nkeep_recent_messages = 4\n\n[session]\nevict_on_farewell = true\n",
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.memory.keep_recent_messages, 4);
        assert!(cfg.session.evict_on_farewell);
        assert_eq!(cfg.memory.max_summaries_in_context, 5);
    }
}
