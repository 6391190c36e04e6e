// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Exactly-once finalization of samples derived from page lifecycle signals.
//!
//! Two independent axes are tracked:
//!
//! ```text
//! LCP:        OBSERVING ──finalize_lcp──> LCP_FINALIZED
//! visibility: PAGE_VISIBLE ──finalize_page_hide──> PAGE_HIDDEN_RECORDED
//! ```
//!
//! Layout shifts accumulate for the whole page lifetime. The accumulator is
//! read, never reset, when a sample needs a CLS value.

use derive_more::Display;
use tracing::debug;

use crate::attributes::Attributes;
use crate::constants::{CLS_ATTRIBUTE, LCP_TIMING, PAGE_HIDE_TIMING, UNLOAD_TIMING};
use crate::timing::TimingSample;

/// Largest-contentful-paint entry reported by the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct LcpEntry {
    pub size: f64,
    pub id: String,
    pub start_time: f64,
}

#[derive(Debug, Clone, PartialEq)]
struct LcpCandidate {
    entry: LcpEntry,
    cls_snapshot: f64,
}

/// What caused LCP finalization. The first one to fire wins.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum LcpTrigger {
    #[display("ceiling timer")]
    Ceiling,
    #[display("first interaction")]
    FirstInteraction,
    #[display("final harvest")]
    FinalHarvest,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityState {
    #[display("visible")]
    Visible,
    #[display("hidden")]
    Hidden,
}

impl VisibilityState {
    /// Parses a platform visibility state. Anything but `hidden` is visible.
    #[must_use]
    pub fn parse(state: &str) -> Self {
        if state.eq_ignore_ascii_case("hidden") {
            VisibilityState::Hidden
        } else {
            VisibilityState::Visible
        }
    }
}

#[derive(Debug)]
pub struct LifecycleTracker {
    cls_supported: bool,
    cls: f64,
    lcp: Option<LcpCandidate>,
    lcp_finalized: bool,
    page_hide_finalized: bool,
}

impl LifecycleTracker {
    /// `cls_supported` is detected once, when the page session starts.
    #[must_use]
    pub fn new(cls_supported: bool) -> Self {
        Self {
            cls_supported,
            cls: 0.0,
            lcp: None,
            lcp_finalized: false,
            page_hide_finalized: false,
        }
    }

    #[must_use]
    pub fn cls_supported(&self) -> bool {
        self.cls_supported
    }

    /// Current cumulative layout shift, `None` when unsupported.
    #[must_use]
    pub fn cls_snapshot(&self) -> Option<f64> {
        self.cls_supported.then_some(self.cls)
    }

    #[must_use]
    pub fn is_lcp_finalized(&self) -> bool {
        self.lcp_finalized
    }

    #[must_use]
    pub fn is_page_hide_finalized(&self) -> bool {
        self.page_hide_finalized
    }

    pub fn observe_layout_shift(&mut self, value: f64) {
        if self.cls_supported {
            self.cls += value;
        }
    }

    /// Keeps `entry` only if it is strictly larger than the current
    /// candidate, so the first-seen of equally large elements wins.
    pub fn observe_lcp_candidate(&mut self, entry: LcpEntry) {
        if self.lcp_finalized {
            return;
        }
        if let Some(current) = &self.lcp {
            if current.entry.size >= entry.size {
                return;
            }
        }
        self.lcp = Some(LcpCandidate {
            entry,
            cls_snapshot: self.cls,
        });
    }

    /// Emits the LCP sample for the current candidate. The ceiling closes LCP
    /// even without a candidate; the other triggers leave it open until one
    /// exists.
    pub fn finalize_lcp(&mut self, trigger: LcpTrigger) -> Option<TimingSample> {
        if self.lcp_finalized {
            return None;
        }
        let Some(candidate) = self.lcp.as_ref() else {
            if trigger == LcpTrigger::Ceiling {
                self.lcp_finalized = true;
                debug!("LCP ceiling reached without a candidate");
            }
            return None;
        };

        let mut attrs = Attributes::new();
        attrs.insert("size", candidate.entry.size);
        attrs.insert("eid", candidate.entry.id.clone());
        if self.cls_supported {
            attrs.insert(CLS_ATTRIBUTE, candidate.cls_snapshot);
        }
        let sample = TimingSample::new(
            LCP_TIMING,
            Some(candidate.entry.start_time.floor()),
            attrs,
        );

        self.lcp_finalized = true;
        debug!(
            "LCP finalized by {trigger}: size={} eid={}",
            candidate.entry.size, candidate.entry.id
        );
        Some(sample)
    }

    pub fn finalize_page_hide(&mut self, timestamp: f64) -> Option<TimingSample> {
        if self.page_hide_finalized {
            return None;
        }
        self.page_hide_finalized = true;
        Some(self.sample_with_cls(PAGE_HIDE_TIMING, timestamp))
    }

    /// Records page hide if nothing did yet, then an `unload` sample. The
    /// unload sample itself is not deduplicated.
    pub fn finalize_unload(&mut self, now: f64) -> Vec<TimingSample> {
        let mut samples = Vec::with_capacity(2);
        samples.extend(self.finalize_page_hide(now));
        samples.push(self.sample_with_cls(UNLOAD_TIMING, now));
        samples
    }

    fn sample_with_cls(&self, name: &str, value: f64) -> TimingSample {
        let mut attrs = Attributes::new();
        if let Some(cls) = self.cls_snapshot() {
            attrs.insert(CLS_ATTRIBUTE, cls);
        }
        TimingSample::new(name, Some(value), attrs)
    }
}
