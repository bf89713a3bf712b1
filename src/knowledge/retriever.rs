//! 知识检索：为索引查询加超时，并合并世界 / 角色两个范围的结果

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::core::RetrievalError;
use crate::knowledge::{Passage, Scope, SimilarityIndex};

/// 知识检索器
#[derive(Clone)]
pub struct KnowledgeRetriever {
    index: Arc<dyn SimilarityIndex>,
    timeout: Duration,
}

impl KnowledgeRetriever {
    pub fn new(index: Arc<dyn SimilarityIndex>, timeout: Duration) -> Self {
        Self { index, timeout }
    }

    pub fn index_name(&self) -> &str {
        self.index.name()
    }

    /// 最多返回 k 个段落（得分降序）；索引报错或超时返回 `RetrievalError::Unavailable`
    pub async fn retrieve(&self, query: &str, scope: &Scope, k: usize) -> Result<Vec<Passage>, RetrievalError> {
        match tokio::time::timeout(self.timeout, self.index.search(query, scope, k)).await {
            Ok(Ok(mut passages)) => {
                passages.truncate(k);
                debug!(?scope, count = passages.len(), "retrieved passages");
                Ok(passages)
            }
            Ok(Err(e)) => {
                warn!(?scope, error = %e, "similarity index failed");
                Err(e)
            }
            Err(_) => {
                warn!(?scope, timeout_ms = self.timeout.as_millis() as u64, "retrieval timed out");
                Err(RetrievalError::Unavailable(format!(
                    "{} search timed out after {:?}",
                    self.index.name(),
                    self.timeout
                )))
            }
        }
    }
}

/// 合并两个范围的结果：过滤低相关度、按得分重排（同分时世界段落在前）、按文本去重、截断到预算
pub fn merge_passages(
    world: Vec<Passage>,
    character: Vec<Passage>,
    min_relevance: f32,
    budget: usize,
) -> Vec<Passage> {
    let mut merged: Vec<Passage> = world
        .into_iter()
        .chain(character)
        .filter(|p| p.score >= min_relevance)
        .collect();
    merged.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut seen = HashSet::new();
    merged.retain(|p| seen.insert(p.text.clone()));
    merged.truncate(budget);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    fn passage(text: &str, scope: Scope, score: f32) -> Passage {
        Passage {
            text: text.to_string(),
            source: "test".to_string(),
            scope,
            score,
        }
    }

    #[test]
    fn test_merge_reranks_filters_and_caps() {
        let world = vec![
            passage("a", Scope::World, 0.9),
            passage("b", Scope::World, 0.2),
            passage("shared", Scope::World, 0.5),
        ];
        let character = vec![
            passage("c", Scope::Character("elara".into()), 0.95),
            passage("shared", Scope::Character("elara".into()), 0.5),
            passage("d", Scope::Character("elara".into()), 0.5),
        ];
        let merged = merge_passages(world, character, 0.3, 3);
        let texts: Vec<_> = merged.iter().map(|p| p.text.as_str()).collect();
        assert_eq!(texts, vec!["c", "a", "shared"]);
        assert_eq!(merged[2].scope, Scope::World);
    }

    struct SlowIndex;

    #[async_trait]
    impl SimilarityIndex for SlowIndex {
        async fn search(&self, _query: &str, _scope: &Scope, _k: usize) -> Result<Vec<Passage>, RetrievalError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec![])
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    struct BrokenIndex;

    #[async_trait]
    impl SimilarityIndex for BrokenIndex {
        async fn search(&self, _query: &str, _scope: &Scope, _k: usize) -> Result<Vec<Passage>, RetrievalError> {
            Err(RetrievalError::Unavailable("connection refused".into()))
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    #[tokio::test]
    async fn test_timeout_maps_to_unavailable() {
        let retriever = KnowledgeRetriever::new(Arc::new(SlowIndex), Duration::from_millis(20));
        let err = retriever.retrieve("phare", &Scope::World, 3).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Unavailable(ref m) if m.contains("timed out")));
    }

    #[tokio::test]
    async fn test_index_error_is_unavailable() {
        let retriever = KnowledgeRetriever::new(Arc::new(BrokenIndex), Duration::from_secs(1));
        assert!(retriever.retrieve("phare", &Scope::World, 3).await.is_err());
    }
}
