//! 知识检索层：世界观与角色专属知识的相似度索引、带超时的检索器、结果合并

pub mod index;
pub mod retriever;

use std::sync::Arc;

use tracing::{info, warn};

use crate::character::{load_world_documents, CharacterCatalog, CharacterContext, CharacterSource};
use crate::config::AppConfig;
use crate::llm::create_embedder_from_config;

pub use index::{
    cosine_similarity, Chunker, ChunkingConfig, EmbeddingIndex, KeywordIndex, Passage, Scope, SimilarityIndex,
};
pub use retriever::{merge_passages, KnowledgeRetriever};

/// 角色专属知识的来源标识
pub fn character_source(character: &CharacterContext) -> String {
    format!("character:{}", character.id)
}

fn chunker_from_config(config: &AppConfig) -> Chunker {
    Chunker::new(ChunkingConfig {
        chunk_size: config.retrieval.chunk_size,
        chunk_overlap: config.retrieval.chunk_overlap,
        ..Default::default()
    })
}

/// 构建关键词索引：`<data>/world` 下的文档进入 World 范围，目录中每个角色的 knowledge 进入其 Character 范围
pub async fn build_keyword_index(config: &AppConfig, catalog: &CharacterCatalog) -> KeywordIndex {
    let index = KeywordIndex::new(chunker_from_config(config));

    for (source, text) in load_world_documents(config.app.data_dir.join("world")) {
        index.add_document(Scope::World, &source, &text).await;
    }

    for id in catalog.available_ids() {
        match catalog.load(&id).await {
            Ok(character) => {
                for entry in &character.knowledge {
                    index
                        .add_document(Scope::Character(character.id.clone()), &character_source(&character), entry)
                        .await;
                }
            }
            Err(e) => warn!(character_id = %id, error = %e, "skipping character knowledge"),
        }
    }

    let chunks = index.len().await;
    info!(chunks, "keyword index built");
    index
}

/// 配置了嵌入模型且有 API key 时构建向量索引，否则回退到关键词索引
pub async fn build_index(config: &AppConfig, catalog: &CharacterCatalog) -> Arc<dyn SimilarityIndex> {
    let embedder = config.llm.embedding_model.as_deref().and_then(|model| {
        create_embedder_from_config(config.llm.base_url.as_deref(), model, None)
    });

    let Some(embedder) = embedder else {
        return Arc::new(build_keyword_index(config, catalog).await);
    };

    let index = EmbeddingIndex::new(embedder, chunker_from_config(config));
    let mut documents: Vec<(Scope, String, String)> = load_world_documents(config.app.data_dir.join("world"))
        .into_iter()
        .map(|(source, text)| (Scope::World, source, text))
        .collect();
    for id in catalog.available_ids() {
        if let Ok(character) = catalog.load(&id).await {
            for entry in &character.knowledge {
                documents.push((
                    Scope::Character(character.id.clone()),
                    character_source(&character),
                    entry.clone(),
                ));
            }
        }
    }

    for (scope, source, text) in &documents {
        if let Err(e) = index.add_document(scope.clone(), source, text).await {
            warn!(error = %e, "embedding index unavailable, falling back to keyword index");
            return Arc::new(build_keyword_index(config, catalog).await);
        }
    }
    info!(documents = documents.len(), "embedding index built");
    Arc::new(index)
}
