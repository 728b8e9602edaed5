//! Folding action records into run state, and read-side aggregations.
//!
//! `apply` is the only way progress fields of a `RunState` change: it is a
//! pure reducer over (state, record). The `by_round` / `by_actor` views work
//! on the full chronological history read back from the channel logs, not on
//! the bounded recent-actions buffer.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ActionRecord, RunState};

/// Fold one record into the state.
pub fn apply(mut state: RunState, record: &ActionRecord, now: DateTime<Utc>) -> RunState {
    state.recent_actions.push_front(record.clone());
    state
        .recent_actions
        .truncate(state.recent_actions_capacity);

    state
        .channels
        .entry(record.channel.clone())
        .or_default()
        .actions_count += 1;

    if record.round > state.current_round {
        state.current_round = record.round;
    }

    state.touch(now);
    state
}

/// Fold records in order.
pub fn apply_all<'a, I>(state: RunState, records: I, now: DateTime<Utc>) -> RunState
where
    I: IntoIterator<Item = &'a ActionRecord>,
{
    records
        .into_iter()
        .fold(state, |state, record| apply(state, record, now))
}

/// Merge per-channel histories (each in file order) into one chronological list.
///
/// Ordering is by timestamp; ties keep channel order then file order.
pub fn merge_chronological(per_channel: Vec<Vec<ActionRecord>>) -> Vec<ActionRecord> {
    let mut merged: Vec<ActionRecord> = per_channel.into_iter().flatten().collect();
    merged.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    merged
}

/// Filters accepted by the actions query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionFilter {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub actor_id: Option<u64>,
    #[serde(default)]
    pub round: Option<u32>,
}

impl ActionFilter {
    pub fn matches(&self, record: &ActionRecord) -> bool {
        self.channel
            .as_deref()
            .is_none_or(|channel| record.channel == channel)
            && self.actor_id.is_none_or(|id| record.actor_id == id)
            && self.round.is_none_or(|round| record.round == round)
    }
}

/// Newest-first page over a chronological history.
pub fn page_recent(
    chronological: Vec<ActionRecord>,
    filter: &ActionFilter,
    offset: usize,
    limit: usize,
) -> Vec<ActionRecord> {
    chronological
        .into_iter()
        .rev()
        .filter(|record| filter.matches(record))
        .skip(offset)
        .take(limit)
        .collect()
}

/// Inclusive round window for the timeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRange {
    #[serde(default)]
    pub start_round: u32,
    #[serde(default)]
    pub end_round: Option<u32>,
}

impl RoundRange {
    pub fn contains(&self, round: u32) -> bool {
        round >= self.start_round && self.end_round.is_none_or(|end| round <= end)
    }
}

/// Activity within one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round_num: u32,
    pub channel_actions: BTreeMap<String, u64>,
    pub total_actions: u64,
    pub active_agents_count: usize,
    pub active_agents: Vec<u64>,
    pub action_types: BTreeMap<String, u64>,
    pub first_action_time: String,
    pub last_action_time: String,
}

/// Group a chronological history by round, ascending.
pub fn by_round(chronological: &[ActionRecord], range: RoundRange) -> Vec<RoundSummary> {
    struct Acc {
        channel_actions: BTreeMap<String, u64>,
        total: u64,
        agents: BTreeSet<u64>,
        action_types: BTreeMap<String, u64>,
        first: String,
        last: String,
    }

    let mut rounds: BTreeMap<u32, Acc> = BTreeMap::new();
    for record in chronological.iter().filter(|r| range.contains(r.round)) {
        let acc = rounds.entry(record.round).or_insert_with(|| Acc {
            channel_actions: BTreeMap::new(),
            total: 0,
            agents: BTreeSet::new(),
            action_types: BTreeMap::new(),
            first: record.timestamp.clone(),
            last: record.timestamp.clone(),
        });
        *acc.channel_actions.entry(record.channel.clone()).or_default() += 1;
        acc.total += 1;
        acc.agents.insert(record.actor_id);
        *acc.action_types.entry(record.action_type.clone()).or_default() += 1;
        acc.last.clone_from(&record.timestamp);
    }

    rounds
        .into_iter()
        .map(|(round_num, acc)| RoundSummary {
            round_num,
            channel_actions: acc.channel_actions,
            total_actions: acc.total,
            active_agents_count: acc.agents.len(),
            active_agents: acc.agents.into_iter().collect(),
            action_types: acc.action_types,
            first_action_time: acc.first,
            last_action_time: acc.last,
        })
        .collect()
}

/// Activity of one actor across the whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorStats {
    pub agent_id: u64,
    pub agent_name: String,
    pub total_actions: u64,
    pub channel_actions: BTreeMap<String, u64>,
    pub action_types: BTreeMap<String, u64>,
    pub first_action_time: String,
    pub last_action_time: String,
}

/// Group a chronological history by actor.
///
/// Ordered by total descending; ties by first-seen ascending, then actor id.
pub fn by_actor(chronological: &[ActionRecord]) -> Vec<ActorStats> {
    let mut actors: HashMap<u64, ActorStats> = HashMap::new();
    for record in chronological {
        let stats = actors.entry(record.actor_id).or_insert_with(|| ActorStats {
            agent_id: record.actor_id,
            agent_name: record.actor_name.clone(),
            total_actions: 0,
            channel_actions: BTreeMap::new(),
            action_types: BTreeMap::new(),
            first_action_time: record.timestamp.clone(),
            last_action_time: record.timestamp.clone(),
        });
        stats.total_actions += 1;
        *stats
            .channel_actions
            .entry(record.channel.clone())
            .or_default() += 1;
        *stats
            .action_types
            .entry(record.action_type.clone())
            .or_default() += 1;
        stats.last_action_time.clone_from(&record.timestamp);
        if stats.agent_name.is_empty() && !record.actor_name.is_empty() {
            stats.agent_name.clone_from(&record.actor_name);
        }
    }

    let mut result: Vec<ActorStats> = actors.into_values().collect();
    result.sort_by(|a, b| {
        b.total_actions
            .cmp(&a.total_actions)
            .then_with(|| a.first_action_time.cmp(&b.first_action_time))
            .then_with(|| a.agent_id.cmp(&b.agent_id))
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Id, RunStatus};

    fn record(round: u32, ts: &str, channel: &str, actor: u64, kind: &str) -> ActionRecord {
        ActionRecord {
            round,
            timestamp: ts.to_string(),
            channel: channel.to_string(),
            actor_id: actor,
            actor_name: format!("agent-{actor}"),
            action_type: kind.to_string(),
            action_args: serde_json::Map::new(),
            result: None,
            success: true,
        }
    }

    fn running_state(capacity: usize) -> RunState {
        let mut state = RunState::new(Id::from_string("sim"), Utc::now());
        state.status = RunStatus::Running;
        state.recent_actions_capacity = capacity;
        state
    }

    #[test]
    fn apply_counts_channel_and_raises_round() {
        let state = running_state(10);
        let state = apply(
            state,
            &record(2, "2025-01-01T00:00:02", "twitter", 1, "CREATE_POST"),
            Utc::now(),
        );
        assert_eq!(state.current_round, 2);
        assert_eq!(state.channels["twitter"].actions_count, 1);
        assert_eq!(state.total_actions_count(), 1);
    }

    #[test]
    fn current_round_never_decreases_on_out_of_order_records() {
        let records = [
            record(3, "t3", "twitter", 1, "A"),
            record(1, "t1", "reddit", 2, "B"),
            record(5, "t5", "twitter", 1, "A"),
            record(4, "t4", "reddit", 3, "C"),
            record(0, "t0", "reddit", 3, "C"),
        ];
        let mut state = running_state(50);
        let mut last = 0;
        for r in &records {
            state = apply(state, r, Utc::now());
            assert!(state.current_round >= last);
            last = state.current_round;
        }
        assert_eq!(state.current_round, 5);
    }

    #[test]
    fn recent_buffer_is_bounded_newest_first() {
        let records: Vec<ActionRecord> = (0..25)
            .map(|i| record(i, &format!("t{i:02}"), "twitter", u64::from(i), "A"))
            .collect();
        let state = apply_all(running_state(10), &records, Utc::now());
        assert_eq!(state.recent_actions.len(), 10);
        let rounds: Vec<u32> = state.recent_actions.iter().map(|r| r.round).collect();
        assert_eq!(rounds, (15..25).rev().collect::<Vec<_>>());
        assert_eq!(state.channels["twitter"].actions_count, 25);
    }

    #[test]
    fn apply_refreshes_updated_at_monotonically() {
        let state = running_state(5);
        let before = state.updated_at;
        let later = before + chrono::Duration::seconds(3);
        let state = apply(state, &record(1, "t", "twitter", 1, "A"), later);
        assert_eq!(state.updated_at, later);
        let state = apply(state, &record(1, "t", "twitter", 1, "A"), before);
        assert_eq!(state.updated_at, later);
    }

    #[test]
    fn merge_orders_by_timestamp_stably() {
        let twitter = vec![
            record(1, "2025-01-01T00:00:01", "twitter", 1, "A"),
            record(2, "2025-01-01T00:00:03", "twitter", 1, "A"),
        ];
        let reddit = vec![
            record(1, "2025-01-01T00:00:02", "reddit", 2, "B"),
            record(2, "2025-01-01T00:00:03", "reddit", 2, "B"),
        ];
        let merged = merge_chronological(vec![twitter, reddit]);
        let order: Vec<(&str, &str)> = merged
            .iter()
            .map(|r| (r.channel.as_str(), r.timestamp.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("twitter", "2025-01-01T00:00:01"),
                ("reddit", "2025-01-01T00:00:02"),
                ("twitter", "2025-01-01T00:00:03"),
                ("reddit", "2025-01-01T00:00:03"),
            ]
        );
    }

    #[test]
    fn page_recent_is_reverse_chronological() {
        let history = vec![
            record(1, "t1", "twitter", 1, "A"),
            record(2, "t2", "twitter", 2, "B"),
        ];
        let page = page_recent(history.clone(), &ActionFilter::default(), 0, 1);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].round, 2);

        let page = page_recent(history, &ActionFilter::default(), 1, 10);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].round, 1);
    }

    #[test]
    fn page_recent_applies_filters_before_paging() {
        let history = vec![
            record(1, "t1", "twitter", 1, "A"),
            record(1, "t2", "reddit", 2, "B"),
            record(2, "t3", "twitter", 2, "C"),
            record(2, "t4", "reddit", 1, "D"),
        ];
        let filter = ActionFilter {
            channel: Some("reddit".into()),
            ..Default::default()
        };
        let page = page_recent(history.clone(), &filter, 0, 10);
        assert_eq!(
            page.iter().map(|r| r.action_type.as_str()).collect::<Vec<_>>(),
            vec!["D", "B"]
        );

        let filter = ActionFilter {
            actor_id: Some(2),
            round: Some(2),
            ..Default::default()
        };
        let page = page_recent(history, &filter, 0, 10);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].action_type, "C");
    }

    #[test]
    fn by_round_groups_ascending_with_histogram() {
        let history = vec![
            record(2, "t3", "twitter", 1, "LIKE_POST"),
            record(1, "t1", "twitter", 1, "CREATE_POST"),
            record(1, "t2", "reddit", 2, "CREATE_POST"),
            record(2, "t4", "reddit", 1, "LIKE_POST"),
        ];
        let rounds = by_round(&history, RoundRange::default());
        assert_eq!(rounds.len(), 2);
        assert_eq!(rounds[0].round_num, 1);
        assert_eq!(rounds[0].total_actions, 2);
        assert_eq!(rounds[0].active_agents_count, 2);
        assert_eq!(rounds[0].action_types["CREATE_POST"], 2);
        assert_eq!(rounds[0].first_action_time, "t1");
        assert_eq!(rounds[0].last_action_time, "t2");
        assert_eq!(rounds[1].round_num, 2);
        assert_eq!(rounds[1].active_agents, vec![1]);
        assert_eq!(rounds[1].channel_actions["reddit"], 1);
        assert_eq!(rounds[1].channel_actions["twitter"], 1);
    }

    #[test]
    fn by_round_respects_inclusive_range() {
        let history: Vec<ActionRecord> = (0..6)
            .map(|i| record(i, &format!("t{i}"), "twitter", 1, "A"))
            .collect();
        let range = RoundRange {
            start_round: 2,
            end_round: Some(4),
        };
        let rounds: Vec<u32> = by_round(&history, range)
            .iter()
            .map(|r| r.round_num)
            .collect();
        assert_eq!(rounds, vec![2, 3, 4]);
    }

    #[test]
    fn by_actor_orders_by_total_then_first_seen() {
        let history = vec![
            record(1, "t1", "twitter", 3, "A"),
            record(1, "t2", "twitter", 1, "A"),
            record(1, "t3", "reddit", 2, "B"),
            record(2, "t4", "twitter", 2, "A"),
            record(2, "t5", "reddit", 1, "B"),
        ];
        let stats = by_actor(&history);
        let ids: Vec<u64> = stats.iter().map(|s| s.agent_id).collect();
        // Actors 1 and 2 both have two actions; 1 was seen first.
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(stats[0].first_action_time, "t2");
        assert_eq!(stats[0].last_action_time, "t5");
        assert_eq!(stats[0].channel_actions["reddit"], 1);
        assert_eq!(stats[1].action_types["A"], 1);
        assert_eq!(stats[1].action_types["B"], 1);
    }
}
