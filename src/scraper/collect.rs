//! Card-link collection bookkeeping for the scroll loop.
//!
//! The browser side of collection is a thin driver: enumerate visible
//! result-card anchors, feed them in here, scroll, repeat. Everything that
//! decides when the loop stops — collection targets, stale-scroll counting,
//! the consecutive-seen-duplicate early exit — lives in these plain structs
//! so termination behavior is testable without a browser.

use crate::dedup;
use serde::Deserialize;
use std::collections::HashSet;

/// Stop collection once this many consecutive cards were already in the
/// user's seen set: the page is dominated by known businesses.
pub const MAX_CONSECUTIVE_SEEN: usize = 15;

/// Pixels scrolled per iteration in the results feed.
pub const SCROLL_STEP: i64 = 500;

/// A result-card anchor as observed in the DOM.
#[derive(Debug, Clone, Deserialize)]
pub struct AnchorInfo {
    pub href: String,
    pub label: Option<String>,
}

/// A collected card, keyed by place ID, with the aria-label name kept as an
/// extraction fallback.
#[derive(Debug, Clone)]
pub struct CardLink {
    pub place_id: String,
    pub href: String,
    pub card_name: Option<String>,
}

/// Why the collection loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    TargetReached,
    DominatedBySeen,
    StaleScrolls,
    MaxScrolls,
}

/// Collection bounds for one scrape.
#[derive(Debug, Clone, Copy)]
pub struct CollectPlan {
    /// Records the caller asked for.
    pub target_count: usize,
    /// Inflated internal goal that absorbs dedup attrition.
    pub collection_target: usize,
    pub max_scrolls: usize,
    pub stale_scroll_limit: usize,
}

impl CollectPlan {
    /// Derive the plan. Absent an explicit `max_scrolls` it scales with the
    /// target (about five fresh cards per scroll) clamped to [20, 150]; the
    /// collection target is 1.5x the ask when prior results will be skipped,
    /// 1.2x otherwise.
    pub fn new(
        target_count: usize,
        max_scrolls: Option<usize>,
        expects_duplicates: bool,
        stale_scroll_limit: usize,
    ) -> Self {
        let max_scrolls =
            max_scrolls.unwrap_or_else(|| target_count.div_ceil(5).clamp(20, 150));
        let collection_target = if expects_duplicates {
            (target_count * 3).div_ceil(2)
        } else {
            (target_count * 6).div_ceil(5)
        };
        Self {
            target_count,
            collection_target,
            max_scrolls,
            stale_scroll_limit,
        }
    }
}

/// Running state of the collection loop.
#[derive(Debug, Default)]
pub struct CollectTally {
    links: Vec<CardLink>,
    collected_ids: HashSet<String>,
    skipped_ids: HashSet<String>,
    scrolls_performed: usize,
    stale_scrolls: usize,
    stale_streak: usize,
    consecutive_seen: usize,
    last_place_id: Option<String>,
    last_card_index: Option<usize>,
    last_visible_count: usize,
}

impl CollectTally {
    /// Digest one pass over the currently visible anchors. Returns how many
    /// new cards this pass produced; zero-card passes build the stale streak.
    pub fn observe_scroll_pass(
        &mut self,
        anchors: &[AnchorInfo],
        seen_places: &HashSet<String>,
        plan: &CollectPlan,
    ) -> usize {
        self.scrolls_performed += 1;
        self.last_visible_count = anchors.len();
        let mut new_this_pass = 0;

        for (index, anchor) in anchors.iter().enumerate() {
            if self.links.len() >= plan.collection_target {
                break;
            }
            let Some(place_id) = dedup::extract_place_id(&anchor.href) else {
                continue;
            };

            if seen_places.contains(&place_id) {
                // Count each seen ID once, however many passes show it.
                if self.skipped_ids.insert(place_id) {
                    self.consecutive_seen += 1;
                }
                continue;
            }

            // Any not-previously-seen card interrupts a seen streak.
            self.consecutive_seen = 0;

            if self.collected_ids.insert(place_id.clone()) {
                let card_name = anchor
                    .label
                    .as_deref()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from);
                self.last_place_id = Some(place_id.clone());
                self.last_card_index = Some(index);
                self.links.push(CardLink {
                    place_id,
                    href: anchor.href.clone(),
                    card_name,
                });
                new_this_pass += 1;
            }
        }

        if new_this_pass == 0 {
            self.stale_streak += 1;
            self.stale_scrolls += 1;
        } else {
            self.stale_streak = 0;
        }
        new_this_pass
    }

    /// Evaluate the stopping criteria; any one of them ends the loop.
    pub fn should_stop(&self, plan: &CollectPlan) -> Option<StopReason> {
        if self.links.len() >= plan.collection_target {
            return Some(StopReason::TargetReached);
        }
        if self.consecutive_seen >= MAX_CONSECUTIVE_SEEN {
            return Some(StopReason::DominatedBySeen);
        }
        if self.stale_streak >= plan.stale_scroll_limit {
            return Some(StopReason::StaleScrolls);
        }
        if self.scrolls_performed >= plan.max_scrolls {
            return Some(StopReason::MaxScrolls);
        }
        None
    }

    pub fn links(&self) -> &[CardLink] {
        &self.links
    }

    pub fn into_links(self) -> Vec<CardLink> {
        self.links
    }

    pub fn collected(&self) -> usize {
        self.links.len()
    }

    pub fn skipped_duplicates(&self) -> usize {
        self.skipped_ids.len()
    }

    pub fn scrolls_performed(&self) -> usize {
        self.scrolls_performed
    }

    pub fn stale_scrolls(&self) -> usize {
        self.stale_scrolls
    }

    pub fn last_place_id(&self) -> Option<&str> {
        self.last_place_id.as_deref()
    }

    pub fn last_card_index(&self) -> Option<usize> {
        self.last_card_index
    }

    pub fn last_visible_count(&self) -> usize {
        self.last_visible_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor(n: usize) -> AnchorInfo {
        AnchorInfo {
            href: format!("/maps/place/biz-{n}/data=!4m5!1s0x{n:016x}:0x{n:x}!8m2"),
            label: Some(format!("Business {n}")),
        }
    }

    fn place_id(n: usize) -> String {
        format!("0x{n:016x}")
    }

    /// A feed that reveals `per_scroll` more cards on every pass, up to `total`.
    fn visible_after(pass: usize, per_scroll: usize, total: usize) -> Vec<AnchorInfo> {
        (0..((pass + 1) * per_scroll).min(total)).map(anchor).collect()
    }

    #[test]
    fn plan_derives_max_scrolls_and_collection_target() {
        let plan = CollectPlan::new(50, None, false, 5);
        assert_eq!(plan.max_scrolls, 20);
        assert_eq!(plan.collection_target, 60);

        let plan = CollectPlan::new(50, None, true, 5);
        assert_eq!(plan.collection_target, 75);

        // Explicit max_scrolls is honored; the derived one clamps to [20, 150].
        assert_eq!(CollectPlan::new(50, Some(7), false, 5).max_scrolls, 7);
        assert_eq!(CollectPlan::new(1000, None, false, 5).max_scrolls, 150);
        assert_eq!(CollectPlan::new(10, None, false, 5).max_scrolls, 20);

        // Ceiling arithmetic, not truncation.
        assert_eq!(CollectPlan::new(51, None, true, 5).collection_target, 77);
        assert_eq!(CollectPlan::new(51, None, false, 5).collection_target, 62);
    }

    #[test]
    fn fresh_feed_reaches_collection_target() {
        let plan = CollectPlan::new(50, None, false, 5);
        let seen = HashSet::new();
        let mut tally = CollectTally::default();

        let mut stopped = None;
        for pass in 0..plan.max_scrolls {
            tally.observe_scroll_pass(&visible_after(pass, 8, 200), &seen, &plan);
            if let Some(reason) = tally.should_stop(&plan) {
                stopped = Some(reason);
                break;
            }
        }

        assert_eq!(stopped, Some(StopReason::TargetReached));
        assert_eq!(tally.collected(), plan.collection_target);
        assert_eq!(tally.skipped_duplicates(), 0);
        assert!(tally.collected() >= 50 * 6 / 5);
    }

    #[test]
    fn stale_feed_stops_after_limit_with_exact_scroll_count() {
        let plan = CollectPlan::new(50, None, false, 5);
        let seen = HashSet::new();
        let mut tally = CollectTally::default();

        // The feed shows ten cards and never loads more.
        let frozen: Vec<AnchorInfo> = (0..10).map(anchor).collect();
        let mut passes = 0;
        loop {
            tally.observe_scroll_pass(&frozen, &seen, &plan);
            passes += 1;
            if let Some(reason) = tally.should_stop(&plan) {
                assert_eq!(reason, StopReason::StaleScrolls);
                break;
            }
        }

        // One productive scroll plus exactly stale_scroll_limit empty ones.
        assert_eq!(passes, 1 + plan.stale_scroll_limit);
        assert_eq!(tally.scrolls_performed(), 1 + plan.stale_scroll_limit);
        assert_eq!(tally.collected(), 10);
    }

    #[test]
    fn seen_dominated_feed_exits_early_and_counts_each_duplicate_once() {
        let plan = CollectPlan::new(50, None, true, 5);
        let seen: HashSet<String> = (0..200).map(place_id).collect();
        let mut tally = CollectTally::default();

        let mut stopped = None;
        for pass in 0..plan.max_scrolls {
            tally.observe_scroll_pass(&visible_after(pass, 8, 200), &seen, &plan);
            if let Some(reason) = tally.should_stop(&plan) {
                stopped = Some(reason);
                break;
            }
        }

        assert_eq!(stopped, Some(StopReason::DominatedBySeen));
        assert_eq!(tally.collected(), 0);
        // 8 seen on the first pass, 8 more on the second crosses 15.
        assert_eq!(tally.scrolls_performed(), 2);
        assert_eq!(tally.skipped_duplicates(), 16);
    }

    #[test]
    fn new_card_resets_the_consecutive_seen_streak() {
        let plan = CollectPlan::new(50, None, true, 5);
        let seen: HashSet<String> = (0..14).map(place_id).collect();
        let mut tally = CollectTally::default();

        // Fourteen seen cards then one new one: no early exit.
        let mut anchors: Vec<AnchorInfo> = (0..14).map(anchor).collect();
        anchors.push(anchor(500));
        tally.observe_scroll_pass(&anchors, &seen, &plan);

        assert!(tally.should_stop(&plan).is_none());
        assert_eq!(tally.collected(), 1);
        assert_eq!(tally.skipped_duplicates(), 14);
    }

    #[test]
    fn max_scrolls_bounds_a_slowly_growing_feed() {
        let plan = CollectPlan::new(200, Some(6), false, 5);
        let seen = HashSet::new();
        let mut tally = CollectTally::default();

        let mut stopped = None;
        for pass in 0..100 {
            tally.observe_scroll_pass(&visible_after(pass, 3, 1000), &seen, &plan);
            if let Some(reason) = tally.should_stop(&plan) {
                stopped = Some(reason);
                break;
            }
        }

        assert_eq!(stopped, Some(StopReason::MaxScrolls));
        assert_eq!(tally.scrolls_performed(), 6);
    }

    #[test]
    fn collected_links_keep_feed_order_and_fallback_names() {
        let plan = CollectPlan::new(50, None, false, 5);
        let mut tally = CollectTally::default();
        tally.observe_scroll_pass(&visible_after(0, 5, 200), &HashSet::new(), &plan);

        let links = tally.links();
        assert_eq!(links.len(), 5);
        assert_eq!(links.first().unwrap().place_id, place_id(0));
        assert_eq!(links.last().unwrap().place_id, place_id(4));
        assert_eq!(links.first().unwrap().card_name.as_deref(), Some("Business 0"));
        assert_eq!(tally.last_place_id(), Some(place_id(4).as_str()));
        assert_eq!(tally.last_card_index(), Some(4));
    }

    #[test]
    fn anchors_without_place_ids_are_ignored() {
        let plan = CollectPlan::new(50, None, false, 5);
        let mut tally = CollectTally::default();
        let anchors = vec![
            AnchorInfo { href: "/maps/place/no-id-here".to_string(), label: None },
            anchor(1),
        ];
        let new = tally.observe_scroll_pass(&anchors, &HashSet::new(), &plan);
        assert_eq!(new, 1);
        assert_eq!(tally.collected(), 1);
    }
}
