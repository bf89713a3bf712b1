//! 角色目录：按 id 从 `<data>/characters/<id>.json` 加载并缓存；世界观文档从 `<data>/world/*.{md,txt}` 读取

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::character::CharacterContext;
use crate::core::CharacterError;

/// 角色数据源：只读，按 id 加载，进程生命周期内缓存
#[async_trait]
pub trait CharacterSource: Send + Sync {
    async fn load(&self, character_id: &str) -> Result<Arc<CharacterContext>, CharacterError>;
}

/// 基于目录（或预置列表）的角色目录
#[derive(Debug, Default)]
pub struct CharacterCatalog {
    dir: Option<PathBuf>,
    cache: RwLock<HashMap<String, Arc<CharacterContext>>>,
}

impl CharacterCatalog {
    /// 从目录按需加载
    pub fn open(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: Some(dir.as_ref().to_path_buf()),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// 预置角色（测试或嵌入式使用），不读磁盘
    pub fn from_characters(characters: impl IntoIterator<Item = CharacterContext>) -> Self {
        let cache = characters
            .into_iter()
            .map(|c| (c.id.clone(), Arc::new(c)))
            .collect();
        Self {
            dir: None,
            cache: RwLock::new(cache),
        }
    }

    /// 目录中可用的角色 id（按字母序）
    pub fn available_ids(&self) -> Vec<String> {
        let Some(dir) = &self.dir else {
            return Vec::new();
        };
        let pattern = dir.join("*.json");
        let mut ids: Vec<String> = glob::glob(&pattern.to_string_lossy())
            .map(|paths| {
                paths
                    .filter_map(Result::ok)
                    .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// 缓存中的角色（已加载过的）
    pub async fn loaded(&self) -> Vec<Arc<CharacterContext>> {
        let cache = self.cache.read().await;
        let mut all: Vec<_> = cache.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    async fn read_from_disk(&self, dir: &Path, character_id: &str) -> Result<CharacterContext, CharacterError> {
        // id 来自外部输入，不允许路径分隔
        if character_id.is_empty()
            || !character_id
                .chars()
                .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CharacterError::NotFound(character_id.to_string()));
        }

        let path = dir.join(format!("{}.json", character_id));
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CharacterError::NotFound(character_id.to_string()));
            }
            Err(source) => {
                return Err(CharacterError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        let character: CharacterContext =
            serde_json::from_str(&data).map_err(|source| CharacterError::Parse {
                path: path.display().to_string(),
                source,
            })?;

        if character.id != character_id {
            return Err(CharacterError::Invalid {
                id: character_id.to_string(),
                reason: format!("file declares id {}", character.id),
            });
        }
        character.validate()?;
        Ok(character)
    }
}

#[async_trait]
impl CharacterSource for CharacterCatalog {
    async fn load(&self, character_id: &str) -> Result<Arc<CharacterContext>, CharacterError> {
        if let Some(c) = self.cache.read().await.get(character_id) {
            return Ok(c.clone());
        }

        let Some(dir) = &self.dir else {
            return Err(CharacterError::NotFound(character_id.to_string()));
        };

        let character = self.read_from_disk(dir, character_id).await?;
        let mut cache = self.cache.write().await;
        // 并发首次加载时以先写入者为准
        let entry = cache
            .entry(character_id.to_string())
            .or_insert_with(|| Arc::new(character));
        info!(character_id, triggers = entry.triggers.len(), "character loaded");
        Ok(entry.clone())
    }
}

/// 读取世界观文档：返回 (来源文件名, 内容)，按文件名排序；目录不存在时为空
pub fn load_world_documents(dir: impl AsRef<Path>) -> Vec<(String, String)> {
    let dir = dir.as_ref();
    let mut docs = Vec::new();
    for ext in ["md", "txt"] {
        let pattern = dir.join(format!("*.{}", ext));
        let paths = match glob::glob(&pattern.to_string_lossy()) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(pattern = %pattern.display(), error = %e, "invalid world glob pattern");
                continue;
            }
        };
        for path in paths.filter_map(Result::ok) {
            match std::fs::read_to_string(&path) {
                Ok(text) => {
                    let source = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    docs.push((source, text));
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to read world document"),
            }
        }
    }
    docs.sort_by(|a, b| a.0.cmp(&b.0));
    debug!(count = docs.len(), dir = %dir.display(), "world documents loaded");
    docs
}
