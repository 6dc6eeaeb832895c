//! Tag suggestions and ranked document search.
//!
//! Tag counts are usage frequency: every explicit tag filter and every text
//! query that found something is recorded, and suggestions rank by that count.
//! Related tags are computed on read from the full result set.

pub mod tokenizer;

use crate::error::{Result, SupportDeskError};
use crate::query::executor::paginate;
use crate::query::{DocumentQuery, SortBy};
use crate::store::{load, pending, write_entity, LocalStore};
use crate::types::{Document, DocumentType, EntityId, EntityKind, MutationOp, Tag};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokenizer::normalize;

pub const DEFAULT_SUGGESTION_LIMIT: usize = 10;

/// Filters applied alongside a search query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchOptions {
    pub tags: Vec<String>,
    pub category_id: Option<EntityId>,
    pub include_descendants: bool,
    #[serde(rename = "type")]
    pub doc_type: Option<DocumentType>,
    pub sort_by: Option<SortBy>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl SearchOptions {
    fn into_query(self, text: &str) -> DocumentQuery {
        DocumentQuery {
            text_query: Some(text.to_string()),
            tags: self.tags,
            category_id: self.category_id,
            include_descendants: self.include_descendants,
            doc_type: self.doc_type,
            sort_by: self.sort_by,
            limit: self.limit,
            offset: self.offset,
        }
    }
}

/// A tag that co-occurs with the search results, and on how many of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedTag {
    pub name: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    pub documents: Vec<Document>,
    pub total_results: usize,
    pub tags: Vec<RelatedTag>,
}

impl LocalStore {
    /// Tags starting with `prefix` (case-insensitive), most used first, ties
    /// by name. An empty prefix returns the most popular tags.
    pub async fn suggest(&self, prefix: &str, limit: usize) -> Result<Vec<Tag>> {
        if limit > self.config().max_page_size {
            return Err(SupportDeskError::InvalidQuery(format!(
                "limit {} exceeds maximum page size {}",
                limit,
                self.config().max_page_size
            )));
        }
        let prefix = normalize(prefix);
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached("SELECT payload FROM tags ORDER BY count DESC")?;
            let payloads = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut tags = Vec::new();
            for p in payloads {
                let tag: Tag = serde_json::from_str(&p)?;
                if normalize(&tag.name).starts_with(&prefix) {
                    tags.push(tag);
                }
            }
            tags.sort_by(|a, b| {
                b.count
                    .cmp(&a.count)
                    .then_with(|| normalize(&a.name).cmp(&normalize(&b.name)))
            });
            tags.truncate(limit);
            Ok(tags)
        })
        .await
    }

    /// Count one use of `term` as a filter, creating the tag on first use.
    pub async fn record_usage(&self, term: &str) -> Result<Tag> {
        let term = term.trim().to_string();
        if term.is_empty() {
            return Err(SupportDeskError::InvalidQuery(
                "cannot record usage of an empty term".to_string(),
            ));
        }
        let now = self.now();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let tag = match load::<Tag>(&tx, &term)? {
                Some(mut existing) => {
                    existing.count += 1;
                    existing.updated_at = now;
                    existing
                }
                None => Tag {
                    name: term,
                    count: 1,
                    updated_at: now,
                },
            };
            write_entity(&tx, &tag)?;
            pending::enqueue(
                &tx,
                EntityKind::Tag,
                &tag.name,
                MutationOp::IncrementTag,
                serde_json::json!({ "delta": 1 }),
                now,
            )?;
            tx.commit()?;
            Ok(tag)
        })
        .await
    }

    /// Ranked document search with related tags.
    ///
    /// Tag filters are promoted unconditionally; the query text only when it
    /// matched at least one document. A failure to record usage fails the
    /// search.
    pub async fn search(&self, query: &str, options: SearchOptions) -> Result<SearchResults> {
        let doc_query = options.into_query(query);
        let limit = doc_query
            .effective_limit()
            .min(self.config().max_page_size);
        let offset = doc_query.offset;
        let filter_tags = doc_query.tags.clone();

        let hits = self.document_hits(doc_query).await?;
        let tags = related_tags(
            hits.iter().map(|h| &h.item),
            &filter_tags,
            self.config().related_tag_limit,
        );
        let page = paginate(hits, limit, offset);

        for tag in filter_tags.iter().filter(|t| !t.trim().is_empty()) {
            self.record_usage(tag).await?;
        }
        let text = query.trim();
        if !text.is_empty() && page.total_count > 0 {
            self.record_usage(text).await?;
        }

        tracing::debug!(
            "[SEARCH] '{}' -> {} results, {} related tags",
            text,
            page.total_count,
            tags.len()
        );
        Ok(SearchResults {
            documents: page.items,
            total_results: page.total_count,
            tags,
        })
    }
}

/// Most frequent tags across `docs`, excluding the ones already filtered on.
fn related_tags<'a>(
    docs: impl Iterator<Item = &'a Document>,
    exclude: &[String],
    limit: usize,
) -> Vec<RelatedTag> {
    let excluded: HashSet<String> = exclude.iter().map(|t| normalize(t)).collect();
    let mut counts: HashMap<String, (String, usize)> = HashMap::new();
    for doc in docs {
        for tag in &doc.tags {
            let key = normalize(tag);
            if excluded.contains(&key) {
                continue;
            }
            counts.entry(key).or_insert_with(|| (tag.clone(), 0)).1 += 1;
        }
    }

    let mut related: Vec<RelatedTag> = counts
        .into_values()
        .map(|(name, count)| RelatedTag { name, count })
        .collect();
    related.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| normalize(&a.name).cmp(&normalize(&b.name)))
    });
    related.truncate(limit);
    related
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    #[tokio::test]
    async fn test_suggestions_rank_by_usage() {
        let store = LocalStore::open_in_memory().await.unwrap();
        for _ in 0..3 {
            store.record_usage("Installation").await.unwrap();
        }
        store.record_usage("Felsökning").await.unwrap();

        let all = store.suggest("", 10).await.unwrap();
        let names: Vec<_> = all.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Installation", "Felsökning"]);
        assert_eq!(all[0].count, 3);

        let f = store.suggest("fel", 10).await.unwrap();
        assert_eq!(f.len(), 1);
        assert_eq!(f[0].name, "Felsökning");
    }

    #[tokio::test]
    async fn test_usage_is_case_insensitive() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store.record_usage("Installation").await.unwrap();
        let tag = store.record_usage("installation").await.unwrap();
        assert_eq!(tag.name, "Installation");
        assert_eq!(tag.count, 2);
        assert_eq!(store.suggest("", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_usage_folds_non_ascii_case() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store.record_usage("Felsökning").await.unwrap();
        let tag = store.record_usage("FELSÖKNING").await.unwrap();
        assert_eq!(tag.name, "Felsökning");
        assert_eq!(tag.count, 2);

        let found = store.suggest("FELSÖ", 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].count, 2);
    }

    #[tokio::test]
    async fn test_suggest_ties_break_by_name() {
        let store = LocalStore::open(
            StoreConfig::in_memory().with_seed_tags(["Wiring", "Alarm", "boiler"]),
        )
        .await
        .unwrap();
        let names: Vec<_> = store
            .suggest("", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["Alarm", "boiler", "Wiring"]);
    }

    #[tokio::test]
    async fn test_search_promotes_matching_text_only() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store
            .put(
                Document::new("Pump installation", DocumentType::Installation)
                    .with_tags(["Installation", "Pumps"]),
            )
            .await
            .unwrap();

        let found = store.search("pump", SearchOptions::default()).await.unwrap();
        assert_eq!(found.total_results, 1);
        assert_eq!(found.tags.len(), 2);

        let missed = store
            .search("chiller", SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(missed.total_results, 0);

        let names: Vec<_> = store
            .suggest("", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["pump"]);
    }

    #[tokio::test]
    async fn test_search_promotes_tag_filters_and_excludes_them_from_related() {
        let store = LocalStore::open_in_memory().await.unwrap();
        store
            .put(Document::new("Manual A", DocumentType::Manual).with_tags(["Pumps", "Service"]))
            .await
            .unwrap();
        store
            .put(Document::new("Manual B", DocumentType::Manual).with_tags(["Pumps", "Service", "Wiring"]))
            .await
            .unwrap();

        let options = SearchOptions {
            tags: vec!["pumps".to_string()],
            ..SearchOptions::default()
        };
        let results = store.search("manual", options).await.unwrap();
        assert_eq!(results.total_results, 2);
        assert_eq!(
            results.tags,
            vec![
                RelatedTag { name: "Service".to_string(), count: 2 },
                RelatedTag { name: "Wiring".to_string(), count: 1 },
            ]
        );
        assert_eq!(store.require::<Tag>("pumps").await.unwrap().count, 1);
    }
}
