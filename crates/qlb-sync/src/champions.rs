use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use qlb_core::{
    period_start, Category, CategoryScores, Clock, EntityType, IndividualRanking, MonthlyChampion,
    QUALIFYING_KLOC,
};
use qlb_storage::{EntityStore, StoreResult};
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

/// Supporting numbers stored alongside a champion for auditing.
fn metric_details(category: Category, scores: &CategoryScores) -> Value {
    let tally = &scores.tally;
    match category {
        Category::DefectTerminator => json!({
            "violations_resolved": tally.violations_resolved,
            "violations_introduced": tally.violations_introduced,
            "net_resolved": scores.defect_terminator_score,
        }),
        Category::CodeRock => json!({
            "bugs_introduced": tally.bugs_introduced,
            "bugs_per_kloc": scores.code_rock_score,
            "total_kloc": scores.total_kloc,
        }),
        Category::CodeShield => json!({
            "vulnerabilities_introduced": tally.vulnerabilities_introduced,
            "vulnerabilities_per_kloc": scores.code_shield_score,
            "total_kloc": scores.total_kloc,
        }),
        Category::Craftsman => json!({
            "code_smells_introduced": tally.code_smells_introduced,
            "code_smells_per_kloc": scores.craftsman_score,
            "total_kloc": scores.total_kloc,
        }),
        Category::Climber => Value::Null,
    }
}

fn climber_details(row: &IndividualRanking) -> Value {
    json!({
        "climber_score": row.climber_score,
        "defect_terminator_rank": row.scores.defect_terminator_rank,
        "code_rock_rank": row.scores.code_rock_rank,
        "code_shield_rank": row.scores.code_shield_rank,
        "craftsman_rank": row.scores.craftsman_rank,
    })
}

/// Whether a rank-1 entry may actually be crowned.
fn eligible(category: Category, scores: &CategoryScores, climber_score: f64) -> bool {
    match category {
        Category::Climber => climber_score > 0.0,
        c if c.requires_kloc() => scores.total_kloc >= QUALIFYING_KLOC,
        _ => true,
    }
}

struct Candidate<'a> {
    entity_id: Uuid,
    tie_key: &'a str,
    name: &'a str,
    rank: i32,
    score: f64,
    climber_score: f64,
    scores: &'a CategoryScores,
    details: Value,
}

/// Picks the single rank-1 candidate, lowest tie key first if several claim it.
fn pick<'a>(category: Category, candidates: Vec<Candidate<'a>>) -> Option<Candidate<'a>> {
    candidates
        .into_iter()
        .filter(|c| c.rank == 1 && eligible(category, c.scores, c.climber_score))
        .min_by(|a, b| a.tie_key.cmp(b.tie_key))
}

/// Selects and stores one champion per category and entity type.
pub struct ChampionSelector {
    store: Arc<dyn EntityStore>,
    clock: Arc<dyn Clock>,
}

impl ChampionSelector {
    pub fn new(store: Arc<dyn EntityStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Rebuilds the period's champion set from its stored rankings. Existing
    /// champions for the period are replaced as a whole.
    pub async fn select_for_period(&self, period: NaiveDate) -> StoreResult<Vec<MonthlyChampion>> {
        let period = period_start(period);
        let now = self.clock.now();

        let developers: HashMap<Uuid, (String, String)> = self
            .store
            .list_active_developers()
            .await?
            .into_iter()
            .map(|d| (d.id, (d.author_key, d.display_name)))
            .collect();
        let projects: HashMap<Uuid, (String, String)> = self
            .store
            .list_active_projects()
            .await?
            .into_iter()
            .map(|p| (p.id, (p.project_key, p.name)))
            .collect();
        let individuals = self.store.individual_rankings_for_period(period).await?;
        let project_rows = self.store.project_rankings_for_period(period).await?;

        let mut champions = Vec::new();
        let individual_categories = Category::BASE.into_iter().chain([Category::Climber]);
        for category in individual_categories {
            let candidates = individuals
                .iter()
                .filter_map(|row| {
                    let (key, name) = developers.get(&row.developer_id)?;
                    Some(Candidate {
                        entity_id: row.developer_id,
                        tie_key: key,
                        name,
                        rank: row.rank(category),
                        score: row.score(category),
                        climber_score: row.climber_score,
                        scores: &row.scores,
                        details: if category == Category::Climber {
                            climber_details(row)
                        } else {
                            metric_details(category, &row.scores)
                        },
                    })
                })
                .collect();
            if let Some(winner) = pick(category, candidates) {
                champions.push(champion(period, category, EntityType::Individual, winner, now));
            } else {
                debug!(%category, "no individual champion");
            }
        }

        for category in Category::BASE {
            let candidates = project_rows
                .iter()
                .filter_map(|row| {
                    let (key, name) = projects.get(&row.project_id)?;
                    Some(Candidate {
                        entity_id: row.project_id,
                        tie_key: key,
                        name,
                        rank: row.scores.rank(category).unwrap_or_default(),
                        score: row.scores.score(category).unwrap_or_default(),
                        climber_score: 0.0,
                        scores: &row.scores,
                        details: metric_details(category, &row.scores),
                    })
                })
                .collect();
            if let Some(winner) = pick(category, candidates) {
                champions.push(champion(period, category, EntityType::Project, winner, now));
            } else {
                debug!(%category, "no project champion");
            }
        }

        self.store
            .replace_champions(period, champions.clone())
            .await?;
        info!(%period, champions = champions.len(), "champions stored");
        Ok(champions)
    }
}

fn champion(
    period: NaiveDate,
    category: Category,
    entity_type: EntityType,
    winner: Candidate<'_>,
    now: chrono::DateTime<chrono::Utc>,
) -> MonthlyChampion {
    MonthlyChampion {
        id: MonthlyChampion::champion_id(period, category, entity_type),
        period,
        category,
        entity_type,
        entity_id: winner.entity_id,
        entity_name: winner.name.to_string(),
        score: winner.score,
        metric_details: winner.details,
        created_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use qlb_core::{FixedClock, IssueTally, NewDeveloper, SENTINEL_RANK};
    use qlb_storage::InMemoryStore;

    fn period() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn row(developer_id: Uuid, ranks: [i32; 4], kloc: f64, climber: (f64, i32)) -> IndividualRanking {
        IndividualRanking {
            id: IndividualRanking::snapshot_id(developer_id, period()),
            developer_id,
            ranking_period: period(),
            scores: CategoryScores {
                tally: IssueTally {
                    violations_resolved: 4,
                    bugs_introduced: 1,
                    violations_introduced: 1,
                    ..IssueTally::default()
                },
                total_kloc: kloc,
                defect_terminator_score: 3,
                defect_terminator_rank: ranks[0],
                code_rock_score: 0.5,
                code_rock_rank: ranks[1],
                code_shield_score: 0.0,
                code_shield_rank: ranks[2],
                craftsman_score: 0.0,
                craftsman_rank: ranks[3],
            },
            climber_score: climber.0,
            climber_rank: climber.1,
        }
    }

    async fn developer(store: &InMemoryStore, key: &str) -> Uuid {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        store
            .insert_developer(
                NewDeveloper {
                    author_key: key.into(),
                    display_name: key.to_uppercase(),
                    email: None,
                },
                now,
            )
            .await
            .unwrap()
            .id
    }

    fn selector(store: Arc<InMemoryStore>) -> ChampionSelector {
        let clock = FixedClock(Utc.with_ymd_and_hms(2024, 4, 1, 3, 0, 0).unwrap());
        ChampionSelector::new(store, Arc::new(clock))
    }

    #[tokio::test]
    async fn density_and_climber_winners_must_pass_rechecks() {
        let store = Arc::new(InMemoryStore::new());
        let dev = developer(&store, "alice").await;
        // Rank 1 everywhere but under the KLOC bar and with no climb.
        store
            .replace_individual_rankings(period(), vec![row(dev, [1, 1, 1, 1], 0.5, (0.0, 1))])
            .await
            .unwrap();

        let champions = selector(store.clone()).select_for_period(period()).await.unwrap();
        assert_eq!(champions.len(), 1);
        assert_eq!(champions[0].category, Category::DefectTerminator);
        assert_eq!(champions[0].entity_name, "ALICE");
        assert_eq!(champions[0].metric_details["net_resolved"], 3);
    }

    #[tokio::test]
    async fn reselection_replaces_previous_champions() {
        let store = Arc::new(InMemoryStore::new());
        let dev = developer(&store, "alice").await;
        store
            .replace_individual_rankings(period(), vec![row(dev, [1, 1, 1, 1], 2.0, (1.5, 1))])
            .await
            .unwrap();
        let first = selector(store.clone()).select_for_period(period()).await.unwrap();
        assert_eq!(first.len(), 5);
        let climber = first.iter().find(|c| c.category == Category::Climber).unwrap();
        assert_eq!(climber.score, 1.5);
        assert_eq!(first[1].metric_details["bugs_per_kloc"], 0.5);

        store
            .replace_individual_rankings(
                period(),
                vec![row(dev, [1, SENTINEL_RANK, SENTINEL_RANK, SENTINEL_RANK], 0.2, (0.0, 1))],
            )
            .await
            .unwrap();
        selector(store.clone()).select_for_period(period()).await.unwrap();
        let stored = store.champions_for_period(period()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, MonthlyChampion::champion_id(period(), Category::DefectTerminator, EntityType::Individual));
    }

    #[tokio::test]
    async fn duplicate_rank_one_yields_a_single_champion() {
        let store = Arc::new(InMemoryStore::new());
        let bob = developer(&store, "bob").await;
        let alice = developer(&store, "alice").await;
        store
            .replace_individual_rankings(
                period(),
                vec![
                    row(bob, [1, SENTINEL_RANK, SENTINEL_RANK, SENTINEL_RANK], 0.0, (0.0, 1)),
                    row(alice, [1, SENTINEL_RANK, SENTINEL_RANK, SENTINEL_RANK], 0.0, (0.0, 2)),
                ],
            )
            .await
            .unwrap();
        let champions = selector(store).select_for_period(period()).await.unwrap();
        let terminators: Vec<_> = champions
            .iter()
            .filter(|c| c.category == Category::DefectTerminator)
            .collect();
        assert_eq!(terminators.len(), 1);
        assert_eq!(terminators[0].entity_id, alice);
    }
}
