use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::NaiveDate;
use qlb_core::{
    period_end, period_start, previous_period, round_half_up, Category, CategoryScores,
    IndividualRanking, IssueTally, ProjectRanking, SENTINEL_RANK,
};
use qlb_storage::{EntityStore, StoreResult};
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::aggregator::{MetricsAggregator, MetricsSource};

/// One entity's entry in a single category sort.
#[derive(Debug, Clone, Copy)]
pub struct RankInput<'a> {
    pub score: f64,
    pub tie_key: &'a str,
    pub qualified: bool,
}

/// Sequential 1-based ranks in input order. Qualified entries are sorted by
/// score, then by ascending tie key; unqualified entries get the sentinel.
pub fn rank_entries(inputs: &[RankInput<'_>], higher_is_better: bool) -> Vec<i32> {
    let mut order: Vec<usize> = (0..inputs.len()).filter(|&i| inputs[i].qualified).collect();
    order.sort_by(|&a, &b| {
        let (x, y) = (&inputs[a], &inputs[b]);
        let by_score = if higher_is_better {
            y.score.total_cmp(&x.score)
        } else {
            x.score.total_cmp(&y.score)
        };
        by_score.then_with(|| x.tie_key.cmp(y.tie_key))
    });

    let mut ranks = vec![SENTINEL_RANK; inputs.len()];
    for (position, index) in order.into_iter().enumerate() {
        ranks[index] = i32::try_from(position + 1).unwrap_or(SENTINEL_RANK);
    }
    ranks
}

/// Raw category scores for a monthly tally. Density scores fall back to the
/// raw count when no KLOC is known.
pub fn category_scores(tally: IssueTally, total_kloc: f64) -> CategoryScores {
    let density = |category: Category| {
        let count = category
            .density_issue_type()
            .map_or(0, |issue_type| tally.introduced_of(issue_type));
        if total_kloc > 0.0 {
            round_half_up(f64::from(count) / total_kloc, 2)
        } else {
            f64::from(count)
        }
    };
    CategoryScores {
        tally,
        total_kloc,
        defect_terminator_score: tally.violations_resolved - tally.violations_introduced,
        defect_terminator_rank: SENTINEL_RANK,
        code_rock_score: density(Category::CodeRock),
        code_rock_rank: SENTINEL_RANK,
        code_shield_score: density(Category::CodeShield),
        code_shield_rank: SENTINEL_RANK,
        craftsman_score: density(Category::Craftsman),
        craftsman_rank: SENTINEL_RANK,
    }
}

/// Average rank improvement over the four base categories, computed on the
/// stored ranks as they are. Leaving the sentinel rank counts as a climb from
/// 999; dropping to it never counts against the climber.
pub fn climber_score(previous: Option<&CategoryScores>, current: &CategoryScores) -> f64 {
    let Some(previous) = previous else {
        return 0.0;
    };
    let gained: i32 = Category::BASE
        .iter()
        .map(|&category| {
            match (previous.rank(category), current.rank(category)) {
                (Some(prev), Some(curr)) => prev.saturating_sub(curr).max(0),
                _ => 0,
            }
        })
        .sum();
    round_half_up(f64::from(gained) / Category::BASE.len() as f64, 2)
}

fn assign_base_ranks(rows: &mut [(&str, &mut CategoryScores)]) {
    for category in Category::BASE {
        let inputs: Vec<RankInput<'_>> = rows
            .iter()
            .map(|(key, scores)| RankInput {
                score: scores.score(category).unwrap_or_default(),
                tie_key: *key,
                qualified: !category.requires_kloc() || scores.is_qualified(),
            })
            .collect();
        let higher_is_better = category == Category::DefectTerminator;
        let ranks = rank_entries(&inputs, higher_is_better);
        for ((_, scores), rank) in rows.iter_mut().zip(ranks) {
            scores.set_rank(category, rank);
        }
    }
}

#[derive(Debug, Clone)]
pub struct RankingOutcome {
    pub period: NaiveDate,
    pub source: MetricsSource,
    pub individuals: Vec<IndividualRanking>,
    pub projects: Vec<ProjectRanking>,
}

/// Computes and persists a period's individual and project rankings. Every
/// run rebuilds the period from scratch.
#[derive(Clone)]
pub struct RankingEngine {
    store: Arc<dyn EntityStore>,
    aggregator: MetricsAggregator,
}

impl RankingEngine {
    pub fn new(store: Arc<dyn EntityStore>, aggregator: MetricsAggregator) -> Self {
        Self { store, aggregator }
    }

    pub async fn calculate(&self, period: NaiveDate) -> StoreResult<RankingOutcome> {
        let period = period_start(period);
        self.calculate_inner(period)
            .instrument(info_span!("rank_period", %period))
            .await
    }

    async fn calculate_inner(&self, period: NaiveDate) -> StoreResult<RankingOutcome> {
        let metrics = self.aggregator.period_metrics(period).await?;
        let projects = self.store.list_active_projects().await?;
        let developers = self.store.list_active_developers().await?;

        let mut project_klocs = BTreeMap::new();
        for project in &projects {
            let kloc = self
                .aggregator
                .project_kloc(project.id, Some(&project.project_key), period_end(period))
                .await?;
            project_klocs.insert(project.id, kloc);
        }
        let developer_klocs = self
            .aggregator
            .developer_klocs(&metrics, &project_klocs)
            .await?;

        // Individuals, ordered by author key for stable output.
        let mut developers = developers;
        developers.sort_by(|a, b| a.author_key.cmp(&b.author_key));
        let mut individual_scores: Vec<CategoryScores> = developers
            .iter()
            .map(|dev| {
                category_scores(
                    metrics.developer_total(dev.id),
                    developer_klocs.get(&dev.id).copied().unwrap_or_default(),
                )
            })
            .collect();
        {
            let mut rows: Vec<(&str, &mut CategoryScores)> = developers
                .iter()
                .map(|d| d.author_key.as_str())
                .zip(individual_scores.iter_mut())
                .collect();
            assign_base_ranks(&mut rows);
        }

        let previous: HashMap<Uuid, IndividualRanking> = self
            .store
            .individual_rankings_for_period(previous_period(period))
            .await?
            .into_iter()
            .map(|row| (row.developer_id, row))
            .collect();
        let climber_scores: Vec<f64> = developers
            .iter()
            .zip(&individual_scores)
            .map(|(dev, scores)| climber_score(previous.get(&dev.id).map(|p| &p.scores), scores))
            .collect();
        let climber_inputs: Vec<RankInput<'_>> = developers
            .iter()
            .zip(&climber_scores)
            .map(|(dev, &score)| RankInput {
                score,
                tie_key: &dev.author_key,
                qualified: true,
            })
            .collect();
        let climber_ranks = rank_entries(&climber_inputs, true);

        let individuals: Vec<IndividualRanking> = developers
            .iter()
            .zip(individual_scores)
            .zip(climber_scores.iter().zip(climber_ranks))
            .map(|((dev, scores), (&climber_score, climber_rank))| IndividualRanking {
                id: IndividualRanking::snapshot_id(dev.id, period),
                developer_id: dev.id,
                ranking_period: period,
                scores,
                climber_score,
                climber_rank,
            })
            .collect();

        // Projects, ordered by project key.
        let mut projects = projects;
        projects.sort_by(|a, b| a.project_key.cmp(&b.project_key));
        let mut project_scores: Vec<CategoryScores> = projects
            .iter()
            .map(|p| {
                category_scores(
                    metrics.projects.get(&p.id).copied().unwrap_or_default(),
                    project_klocs.get(&p.id).copied().unwrap_or_default(),
                )
            })
            .collect();
        {
            let mut rows: Vec<(&str, &mut CategoryScores)> = projects
                .iter()
                .map(|p| p.project_key.as_str())
                .zip(project_scores.iter_mut())
                .collect();
            assign_base_ranks(&mut rows);
        }
        let project_rows: Vec<ProjectRanking> = projects
            .iter()
            .zip(project_scores)
            .map(|(project, scores)| ProjectRanking {
                id: ProjectRanking::snapshot_id(project.id, period),
                project_id: project.id,
                ranking_period: period,
                scores,
            })
            .collect();

        self.store
            .replace_individual_rankings(period, individuals.clone())
            .await?;
        self.store
            .replace_project_rankings(period, project_rows.clone())
            .await?;

        info!(
            individuals = individuals.len(),
            projects = project_rows.len(),
            source = ?metrics.source,
            "rankings stored"
        );
        Ok(RankingOutcome {
            period,
            source: metrics.source,
            individuals,
            projects: project_rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(score: f64, key: &str, qualified: bool) -> RankInput<'_> {
        RankInput {
            score,
            tie_key: key,
            qualified,
        }
    }

    #[test]
    fn ranks_are_sequential_with_key_tie_break() {
        let inputs = [
            input(3.0, "carol", true),
            input(5.0, "bob", true),
            input(5.0, "alice", true),
            input(-1.0, "dave", true),
        ];
        assert_eq!(rank_entries(&inputs, true), vec![3, 2, 1, 4]);
        assert_eq!(rank_entries(&inputs, false), vec![2, 4, 3, 1]);
    }

    #[test]
    fn unqualified_entries_get_sentinel_regardless_of_score() {
        let inputs = [
            input(0.0, "tiny", false),
            input(4.2, "big", true),
            input(1.1, "mid", true),
        ];
        assert_eq!(rank_entries(&inputs, false), vec![SENTINEL_RANK, 2, 1]);
    }

    #[test]
    fn density_scores_divide_by_kloc_or_keep_raw_counts() {
        let tally = IssueTally {
            violations_introduced: 6,
            violations_resolved: 10,
            bugs_introduced: 3,
            vulnerabilities_introduced: 1,
            code_smells_introduced: 2,
        };
        let scores = category_scores(tally, 1.5);
        assert_eq!(scores.defect_terminator_score, 4);
        assert_eq!(scores.code_rock_score, 2.0);
        assert_eq!(scores.code_shield_score, 0.67);
        assert_eq!(scores.craftsman_score, 1.33);

        let raw = category_scores(tally, 0.0);
        assert_eq!(raw.code_rock_score, 3.0);
        assert!(!raw.is_qualified());
    }

    fn ranked(dt: i32, rock: i32, shield: i32, craft: i32) -> CategoryScores {
        CategoryScores {
            defect_terminator_rank: dt,
            code_rock_rank: rock,
            code_shield_rank: shield,
            craftsman_rank: craft,
            ..CategoryScores::default()
        }
    }

    #[test]
    fn climber_averages_positive_rank_gains() {
        let previous = ranked(5, 3, 2, 4);
        let current = ranked(2, 3, 1, 2);
        assert_eq!(climber_score(Some(&previous), &current), 1.5);
        // Falling in rank never counts against the climber.
        assert_eq!(climber_score(Some(&current), &previous), 0.0);
        assert_eq!(climber_score(None, &current), 0.0);
    }

    #[test]
    fn climber_counts_leaving_the_sentinel_as_a_full_climb() {
        let previous = ranked(3, SENTINEL_RANK, 2, 2);
        let current = ranked(1, 1, SENTINEL_RANK, 1);
        // (2 + 998 + 0 + 1) / 4
        assert_eq!(climber_score(Some(&previous), &current), 250.25);
        // Sentinel to sentinel is no movement.
        let unranked = ranked(SENTINEL_RANK, SENTINEL_RANK, SENTINEL_RANK, SENTINEL_RANK);
        assert_eq!(climber_score(Some(&unranked), &unranked), 0.0);
    }
}
