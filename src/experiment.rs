//! Experimental assignment and the transparency-card link controller.
//!
//! ## Design
//! - Condition and card version are drawn uniformly at random exactly once
//!   per session; `assign_once` is guarded by the already-assigned check and
//!   re-randomizing mid-session is a correctness violation
//! - The card link walks a monotone state machine, NotShown → Shown →
//!   Clicked, with no back-transitions
//! - The show trigger is evaluated when a turn begins streaming: it fires
//!   when exactly one assistant reply already exists, so the card rides on
//!   the second assistant reply
//! - The proceed redirect is recomputed on every render — `link_clicked`
//!   may change between renders and must never be cached

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::session::Session;

/// Experimental variant controlling whether and how the transparency-card
/// link is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    DynamicLink,
    StaticLink,
    NoLink,
}

impl Condition {
    pub const ALL: [Condition; 3] =
        [Condition::DynamicLink, Condition::StaticLink, Condition::NoLink];

    /// Uniform draw over the three conditions.
    pub fn draw(rng: &mut impl Rng) -> Self {
        Self::ALL[rng.gen_range(0..Self::ALL.len())]
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Condition::DynamicLink => write!(f, "dynamic_link"),
            Condition::StaticLink => write!(f, "static_link"),
            Condition::NoLink => write!(f, "no_link"),
        }
    }
}

/// Which variant of the transparency card the link points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardVersion {
    Interactive,
    Static,
}

impl CardVersion {
    pub const ALL: [CardVersion; 2] = [CardVersion::Interactive, CardVersion::Static];

    /// Uniform draw over the two versions.
    pub fn draw(rng: &mut impl Rng) -> Self {
        Self::ALL[rng.gen_range(0..Self::ALL.len())]
    }
}

impl std::fmt::Display for CardVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CardVersion::Interactive => write!(f, "interactive"),
            CardVersion::Static => write!(f, "static"),
        }
    }
}

/// Card-link presentation state. Monotonic per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    NotShown,
    Shown,
    Clicked,
}

/// External destinations the controller redirects to.
#[derive(Debug, Clone)]
pub struct LinkTargets {
    pub survey_url: String,
    pub card_url_interactive: String,
    pub card_url_static: String,
}

// ---------------------------------------------------------------------------
// Assignment
// ---------------------------------------------------------------------------

/// Draw any experimental variable not yet assigned. Fields that are already
/// set are left untouched no matter how often this is called.
pub fn assign_once(session: &mut Session, rng: &mut impl Rng) {
    if session.condition.is_none() {
        session.condition = Some(Condition::draw(rng));
    }
    if session.card_version.is_none() {
        session.card_version = Some(CardVersion::draw(rng));
    }
}

// ---------------------------------------------------------------------------
// Link state machine
// ---------------------------------------------------------------------------

/// Whether the card preamble should ride on the turn that is about to
/// stream. True exactly when one assistant reply already exists, the link
/// has not been shown, and the condition presents a link at all.
pub fn should_show_card(session: &Session) -> bool {
    session.link_state == LinkState::NotShown
        && session.assistant_replies() == 1
        && matches!(session.condition, Some(c) if c != Condition::NoLink)
}

/// NotShown → Shown. Increments `link_shown_count` exactly once per session;
/// a no-op from any other state.
pub fn mark_card_shown(session: &mut Session) {
    if session.link_state == LinkState::NotShown {
        session.link_state = LinkState::Shown;
        session.link_shown_count += 1;
    }
}

/// Shown → Clicked, driven by the page's click callback. Returns true when
/// the transition fired. Clicks before the card is shown, or repeat clicks,
/// change nothing — counters stay monotone and
/// `link_click_count <= link_shown_count` holds.
pub fn record_card_click(session: &mut Session) -> bool {
    if session.link_state == LinkState::Shown {
        session.link_state = LinkState::Clicked;
        session.link_click_count += 1;
        session.link_clicked = true;
        true
    } else {
        false
    }
}

// ---------------------------------------------------------------------------
// Destinations
// ---------------------------------------------------------------------------

fn with_query(base: &str, query: &str) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{base}{sep}{query}")
}

/// The card destination for this session, with tracking parameters. `None`
/// when the condition presents no link.
pub fn card_url(targets: &LinkTargets, session: &Session) -> Option<String> {
    let condition = session.condition?;
    if condition == Condition::NoLink {
        return None;
    }
    let base = match session.card_version? {
        CardVersion::Interactive => &targets.card_url_interactive,
        CardVersion::Static => &targets.card_url_static,
    };
    Some(with_query(
        base,
        &format!(
            "participant_id={}&condition={}&card_version={}&entry_time={}",
            session.participant_id,
            condition,
            session.card_version_label(),
            session.entry_time_ms
        ),
    ))
}

/// The survey destination with the session's outcome parameters.
pub fn survey_url(targets: &LinkTargets, session: &Session) -> String {
    with_query(
        &targets.survey_url,
        &format!(
            "participant_id={}&condition={}&system_card_version={}&link_clicked={}",
            session.participant_id,
            session.condition_label(),
            session.card_version_label(),
            session.link_clicked
        ),
    )
}

/// Whether the proceed action is exposed yet.
pub fn can_proceed(session: &Session) -> bool {
    session.chat_rounds >= 2
}

/// Where the proceed action sends the participant. The survey directly when
/// the condition never showed a link or the link was clicked; otherwise the
/// card itself, forcing the participant through it before the survey.
pub fn proceed_target(targets: &LinkTargets, session: &Session) -> String {
    let straight_to_survey = match session.condition {
        Some(Condition::NoLink) | None => true,
        Some(_) => session.link_clicked,
    };
    if straight_to_survey {
        survey_url(targets, session)
    } else {
        card_url(targets, session).unwrap_or_else(|| survey_url(targets, session))
    }
}
