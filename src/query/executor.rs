use super::{DocumentQuery, SortBy, TicketQuery, Viewable};
use crate::error::Result;
use crate::search::tokenizer::{normalize, tokenize};
use crate::store::{load, table_for, LocalStore};
use crate::types::{Document, Page, SupportTicket};
use rusqlite::{params, Connection};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};

const TITLE_HIT: u32 = 2;
const DESCRIPTION_HIT: u32 = 1;
const TITLE_PHRASE_BONUS: u32 = 3;

/// A matched record and its text relevance (zero without a text query).
#[derive(Debug, Clone)]
pub(crate) struct Hit<T> {
    pub item: T,
    pub score: u32,
}

/// Tag and text criteria shared by every kind of query.
struct Criteria<'a> {
    text: Option<&'a str>,
    tags: &'a [String],
    sort: SortBy,
}

impl LocalStore {
    pub async fn find_documents(&self, query: DocumentQuery) -> Result<Page<Document>> {
        let limit = query.effective_limit().min(self.config().max_page_size);
        let offset = query.offset;
        let hits = self.document_hits(query).await?;
        Ok(paginate(hits, limit, offset))
    }

    pub async fn find_tickets(&self, query: TicketQuery) -> Result<Page<SupportTicket>> {
        query.validate(self.config().max_page_size)?;
        let limit = query.effective_limit().min(self.config().max_page_size);
        let offset = query.offset;

        let hits = self
            .run(move |conn| {
                let criteria = Criteria {
                    text: query.text_filter(),
                    tags: &query.tags,
                    sort: SortBy::resolve(query.sort_by, query.text_filter().is_some()),
                };
                let category = query.category.as_deref().map(normalize);
                matching::<SupportTicket, _>(conn, &criteria, |t| {
                    (query.status.is_empty() || query.status.contains(&t.status))
                        && query.priority.map_or(true, |p| t.priority == p)
                        && query.created_by.as_deref().map_or(true, |u| t.created_by == u)
                        && category
                            .as_deref()
                            .map_or(true, |c| normalize(&t.category) == c)
                })
            })
            .await?;
        Ok(paginate(hits, limit, offset))
    }

    /// Every document matching `query`, ranked, before pagination.
    pub(crate) async fn document_hits(&self, query: DocumentQuery) -> Result<Vec<Hit<Document>>> {
        query.validate(self.config().max_page_size)?;
        self.run(move |conn| {
            let categories = match query.category_id {
                Some(ref root) if query.include_descendants => Some(category_subtree(conn, root)?),
                Some(ref root) => Some(HashSet::from([root.clone()])),
                None => None,
            };
            let criteria = Criteria {
                text: query.text_filter(),
                tags: &query.tags,
                sort: SortBy::resolve(query.sort_by, query.text_filter().is_some()),
            };
            matching::<Document, _>(conn, &criteria, |d| {
                query.doc_type.map_or(true, |t| d.doc_type == t)
                    && categories.as_ref().map_or(true, |set| {
                        d.category_id.as_ref().map_or(false, |c| set.contains(c))
                    })
            })
        })
        .await
    }
}

fn matching<T, F>(conn: &Connection, criteria: &Criteria<'_>, keep: F) -> Result<Vec<Hit<T>>>
where
    T: Viewable,
    F: Fn(&T) -> bool,
{
    let kind = T::KIND.as_str();
    let mut candidates: Option<HashSet<String>> = None;

    for tag in criteria.tags {
        let ids = ids_with_tag(conn, kind, tag)?;
        narrow(&mut candidates, ids);
    }

    let query_tokens = criteria.text.map(tokenize).unwrap_or_default();
    let mut scores: HashMap<String, u32> = HashMap::new();
    for token in &query_tokens {
        let mut ids = HashSet::new();
        for (id, field) in token_hits(conn, kind, token)? {
            let weight = if field == "title" { TITLE_HIT } else { DESCRIPTION_HIT };
            *scores.entry(id.clone()).or_insert(0) += weight;
            ids.insert(id);
        }
        narrow(&mut candidates, ids);
    }

    let records: Vec<T> = match candidates {
        Some(ids) => {
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(record) = load::<T>(conn, &id)? {
                    out.push(record);
                }
            }
            out
        }
        None => load_all::<T>(conn)?,
    };

    let phrase = criteria.text.map(normalize);
    let mut hits = Vec::new();
    for item in records {
        if !keep(&item) {
            continue;
        }
        let mut score = scores.get(item.id()).copied().unwrap_or(0);
        if let Some(ref phrase) = phrase {
            let in_title = item.title().to_lowercase().contains(phrase.as_str());
            if in_title {
                score += TITLE_PHRASE_BONUS;
            }
            // Queries made only of one-letter words have no tokens to match on.
            if query_tokens.is_empty()
                && !in_title
                && !item
                    .indexed_text()
                    .iter()
                    .any(|(_, text)| text.to_lowercase().contains(phrase.as_str()))
            {
                continue;
            }
        }
        hits.push(Hit { item, score });
    }

    hits.sort_by(|a, b| compare(criteria.sort, a, b));
    Ok(hits)
}

fn compare<T: Viewable>(sort: SortBy, a: &Hit<T>, b: &Hit<T>) -> Ordering {
    let newest = b.item.updated_at().cmp(&a.item.updated_at());
    let by_id = a.item.id().cmp(b.item.id());
    match sort {
        SortBy::Relevance => b
            .score
            .cmp(&a.score)
            .then(b.item.views().cmp(&a.item.views()))
            .then(newest)
            .then(by_id),
        SortBy::Newest => newest.then(by_id),
        SortBy::Oldest => a
            .item
            .updated_at()
            .cmp(&b.item.updated_at())
            .then(by_id),
        SortBy::MostViewed => b
            .item
            .views()
            .cmp(&a.item.views())
            .then(newest)
            .then(by_id),
        SortBy::Title => a
            .item
            .title()
            .to_lowercase()
            .cmp(&b.item.title().to_lowercase())
            .then(by_id),
    }
}

pub(crate) fn paginate<T>(hits: Vec<Hit<T>>, limit: usize, offset: usize) -> Page<T> {
    let total_count = hits.len();
    let items = hits
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|h| h.item)
        .collect();
    Page { items, total_count }
}

fn narrow(candidates: &mut Option<HashSet<String>>, ids: HashSet<String>) {
    *candidates = Some(match candidates.take() {
        Some(current) => current.intersection(&ids).cloned().collect(),
        None => ids,
    });
}

fn ids_with_tag(conn: &Connection, kind: &str, tag: &str) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT entity_id FROM entity_tags WHERE kind = ?1 AND tag = ?2",
    )?;
    let ids = stmt
        .query_map(params![kind, normalize(tag)], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<HashSet<_>>>()?;
    Ok(ids)
}

/// (entity id, field) pairs with an indexed token starting with `prefix`.
fn token_hits(conn: &Connection, kind: &str, prefix: &str) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT DISTINCT entity_id, field FROM search_tokens \
         WHERE kind = ?1 AND substr(token, 1, ?2) = ?3",
    )?;
    let rows = stmt
        .query_map(
            params![kind, prefix.chars().count() as i64, prefix],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn load_all<T: Viewable>(conn: &Connection) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(&format!("SELECT payload FROM {}", table_for(T::KIND)))?;
    let payloads = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    payloads
        .iter()
        .map(|p| serde_json::from_str(p).map_err(Into::into))
        .collect()
}

/// `root` and every category below it.
fn category_subtree(conn: &Connection, root: &str) -> Result<HashSet<String>> {
    let mut stmt =
        conn.prepare("SELECT id, json_extract(payload, '$.parentId') FROM categories")?;
    let edges = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut children: HashMap<String, Vec<String>> = HashMap::new();
    for (id, parent) in edges {
        if let Some(parent) = parent {
            children.entry(parent).or_default().push(id);
        }
    }

    let mut out = HashSet::from([root.to_string()]);
    let mut queue = VecDeque::from([root.to_string()]);
    while let Some(current) = queue.pop_front() {
        for child in children.get(&current).into_iter().flatten() {
            if out.insert(child.clone()) {
                queue.push_back(child.clone());
            }
        }
    }
    Ok(out)
}
