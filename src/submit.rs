//! Browser submission of an approved application.
//!
//! One call drives one remote browser session strictly in sequence:
//! navigate, check for anti-bot pages, scroll, fill the cover letter,
//! optionally boost, submit, read the result. Every interaction is followed
//! by a human-like pause. Any failure marks the record `failed` with the
//! error text; there is no automatic retry. The session is always closed.

use std::time::Duration;

use anyhow::Result;
use scraper::{Html, Selector};
use thiserror::Error;
use tokio::time::timeout;

use crate::browser::{BrowserPage, LauncherNotConfigured, Locator, SessionConfig};
use crate::engine::Engine;
use crate::humanize::HumanDelay;
use crate::models::{ApplicationStatus, PendingApplication};

const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);
const COVER_LETTER_TIMEOUT: Duration = Duration::from_secs(15);
const SUBMIT_BUTTON_TIMEOUT: Duration = Duration::from_secs(10);
const BOOST_SECTION_TIMEOUT: Duration = Duration::from_secs(5);
const BOOST_INPUT_TIMEOUT: Duration = Duration::from_secs(3);
const BOOST_LABEL_TIMEOUT: Duration = Duration::from_secs(2);
const CONFIRMATION_WAIT: Duration = Duration::from_secs(5);
const DEFAULT_BOOST: &str = "50";

const BLOCK_MARKERS: [&str; 4] = ["captcha", "security check", "access denied", "blocked"];
const SUCCESS_MARKERS: [&str; 3] = ["proposal submitted", "successfully", "your proposal"];
const ERROR_MARKERS: [&str; 2] = ["error", "failed"];

const COVER_LETTER_FIELD: &[Locator] = &[
    Locator::Css(r#"textarea[data-test="cover-letter-area"]"#),
    Locator::Css(r#"textarea[name="coverLetter"]"#),
    Locator::Css("textarea.cover-letter"),
];

const BOOST_SECTION: &[Locator] = &[
    Locator::Css(r#"[data-test="boost-section"]"#),
    Locator::Css(".boost-proposal"),
    Locator::Css(r#"[class*="boost"]"#),
];

const BOOST_INPUT: &[Locator] = &[
    Locator::Css(r#"[data-test="boost-section"] input[type="number"]"#),
    Locator::Css(r#"[data-test="boost-section"] input[type="text"]"#),
    Locator::Css(r#".boost-proposal input[type="number"]"#),
    Locator::Css(r#".boost-proposal input[type="text"]"#),
    Locator::Css(r#"[class*="boost"] input[type="number"]"#),
    Locator::Css(r#"[class*="boost"] input[type="text"]"#),
];

const BOOST_MAX_LABEL: &[Locator] = &[
    Locator::Css(r#"[data-test="boost-section"] [class*="max"]"#),
    Locator::Css(r#"[data-test="boost-section"] [class*="first"]"#),
    Locator::Css(r#"[data-test="boost-section"] [data-test*="max"]"#),
    Locator::Css(r#".boost-proposal [class*="max"]"#),
    Locator::Css(r#".boost-proposal [class*="first"]"#),
    Locator::Css(r#"[class*="boost"] [class*="max"]"#),
    Locator::Css(r#"[class*="boost"] [class*="first"]"#),
    Locator::Css(r#"[class*="boost"] [data-test*="max"]"#),
];

const SUBMIT_BUTTON: &[Locator] = &[
    Locator::Css(r#"button[data-test="submit-proposal"]"#),
    Locator::XPath(r#"//button[@type="submit" and contains(normalize-space(.), "Submit")]"#),
    Locator::XPath(r#"//button[contains(normalize-space(.), "Submit a Proposal")]"#),
];

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("CIRCUIT_BREAKER: CAPTCHA or security check detected ({marker}), aborting")]
    CircuitBreaker { marker: String },

    #[error("{what} not found within {}s", .waited.as_secs())]
    ElementNotFound { what: &'static str, waited: Duration },

    #[error("Timed out after {}s waiting for {what}", .after.as_secs())]
    Timeout { what: &'static str, after: Duration },

    #[error("Submission may have failed - error detected on page")]
    ErrorMarker,

    #[error("{0}")]
    NotConfigured(String),

    #[error(transparent)]
    Browser(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Record missing, owned by someone else, or no longer `approved`.
    Skipped,
    Submitted { proposal_id: i64, boosted: bool },
    Failed { reason: String },
}

pub fn job_url(external_job_id: &str) -> String {
    format!("https://www.upwork.com/freelance-jobs/apply/{}/", external_job_id)
}

/// Lowercased text a reader would see: text nodes outside script, style and
/// noscript elements.
pub fn visible_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut text = String::new();
    for node in document.root_element().descendants() {
        let Some(fragment) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|parent| parent.value().as_element().map(|el| el.name().to_string()))
            .is_some_and(|name| matches!(name.as_str(), "script" | "style" | "noscript"));
        if !hidden {
            text.push_str(fragment);
            text.push(' ');
        }
    }
    text.to_lowercase()
}

/// Returns the first anti-bot marker found on the page, if any. A challenge
/// iframe counts even when its surrounding text does not mention it.
pub fn detect_block(html: &str) -> Option<&'static str> {
    let has_challenge_frame = Selector::parse(r#"iframe[src*="captcha"]"#)
        .ok()
        .is_some_and(|selector| Html::parse_document(html).select(&selector).next().is_some());
    if has_challenge_frame {
        return Some("captcha");
    }
    let text = visible_text(html);
    BLOCK_MARKERS.into_iter().find(|marker| text.contains(marker))
}

/// Reads the post-submit page. An explicit success marker wins; otherwise an
/// error marker fails the submission; a page with neither counts as success.
pub fn check_outcome(html: &str) -> Result<(), SubmitError> {
    let text = visible_text(html);
    if SUCCESS_MARKERS.iter().any(|marker| text.contains(marker)) {
        return Ok(());
    }
    if ERROR_MARKERS.iter().any(|marker| text.contains(marker)) {
        return Err(SubmitError::ErrorMarker);
    }
    Ok(())
}

/// First whole number in a label such as "Max bid for 1st place: 38 Connects".
pub fn boost_value_from_label(label: &str) -> Option<String> {
    let re = regex::Regex::new(r"(\d+)").ok()?;
    re.captures(label)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Submits one approved application. Storage errors are returned; every
/// browser-side problem ends as a `failed` record and `SubmitOutcome::Failed`.
pub async fn submit_application(engine: &Engine, application_id: i64, user_id: &str) -> Result<SubmitOutcome> {
    let app = match engine.db.get_application(application_id)? {
        Some(app) if app.user_id == user_id && app.status == ApplicationStatus::Approved => app,
        _ => {
            tracing::info!(account = %user_id, application_id, "Application not in approved state, skipping");
            return Ok(SubmitOutcome::Skipped);
        }
    };

    let Some(settings) = engine.db.get_settings(user_id)? else {
        return fail(engine, &app, "No auto-apply settings found".to_string());
    };

    let session = SessionConfig {
        viewport: engine.delay.viewport(),
        stealth: true,
        persistent_context_id: settings.browser_context_id.clone(),
    };
    let page = match engine.launcher.launch(&session).await {
        Ok(page) => page,
        Err(e) if e.is::<LauncherNotConfigured>() => {
            return fail(engine, &app, SubmitError::NotConfigured(e.to_string()).to_string());
        }
        Err(e) => {
            return fail(engine, &app, SubmitError::Browser(e).to_string());
        }
    };

    let result = drive(page.as_ref(), &engine.delay, &app, settings.boost_to_first_place).await;

    if let Err(e) = page.close().await {
        tracing::debug!(application_id, error = %e, "Ignoring error while closing browser session");
    }

    match result {
        Ok(boosted) => match engine.db.record_submission(app.id, boosted, engine.clock.now()) {
            Ok(proposal_id) => {
                tracing::info!(
                    account = %user_id,
                    application_id,
                    proposal_id,
                    job = %app.external_job_id,
                    "Proposal submitted"
                );
                Ok(SubmitOutcome::Submitted { proposal_id, boosted })
            }
            Err(e) => fail(engine, &app, format!("Submitted but could not be recorded: {}", e)),
        },
        Err(e) => {
            if matches!(e, SubmitError::CircuitBreaker { .. }) {
                tracing::error!(account = %user_id, application_id, error = %e, "Anti-bot page detected, submission aborted");
            }
            fail(engine, &app, e.to_string())
        }
    }
}

fn fail(engine: &Engine, app: &PendingApplication, reason: String) -> Result<SubmitOutcome> {
    tracing::error!(account = %app.user_id, application_id = app.id, reason = %reason, "Submission failed");
    engine.db.transition_application(
        app.id,
        ApplicationStatus::Approved,
        ApplicationStatus::Failed,
        Some(&reason),
    )?;
    Ok(SubmitOutcome::Failed { reason })
}

/// The in-page sequence. Returns whether a boost was set.
async fn drive(
    page: &dyn BrowserPage,
    delay: &HumanDelay,
    app: &PendingApplication,
    boost: bool,
) -> Result<bool, SubmitError> {
    let url = job_url(&app.external_job_id);
    tracing::debug!(application_id = app.id, url = %url, "Opening job page");
    timeout(NAVIGATION_TIMEOUT, page.goto(&url))
        .await
        .map_err(|_| SubmitError::Timeout {
            what: "job page to load",
            after: NAVIGATION_TIMEOUT,
        })??;
    delay.pause().await;

    let html = page.content().await?;
    if let Some(marker) = detect_block(&html) {
        return Err(SubmitError::CircuitBreaker {
            marker: marker.to_string(),
        });
    }

    page.scroll_by(delay.scroll_distance(200, 300)).await?;
    delay.pause().await;

    let field = page
        .wait_for(COVER_LETTER_FIELD, COVER_LETTER_TIMEOUT)
        .await?
        .ok_or(SubmitError::ElementNotFound {
            what: "Cover letter field",
            waited: COVER_LETTER_TIMEOUT,
        })?;
    delay.pause().await;
    page.scroll_into_view(&field).await?;
    delay.pause().await;
    page.click(&field).await?;
    delay.pause().await;
    page.fill(&field, &app.cover_letter).await?;
    delay.pause().await;

    let boosted = if boost {
        let boosted = match set_boost(page, delay).await {
            Ok(Some(value)) => {
                tracing::info!(application_id = app.id, connects = %value, "Boost set");
                true
            }
            Ok(None) => {
                tracing::info!(application_id = app.id, "Boost control not found, submitting without boost");
                false
            }
            Err(e) => {
                tracing::warn!(application_id = app.id, error = %e, "Boost failed, submitting without boost");
                false
            }
        };
        delay.pause().await;
        boosted
    } else {
        false
    };

    page.scroll_by(delay.scroll_distance(300, 200)).await?;
    delay.pause().await;

    let submit = page
        .wait_for(SUBMIT_BUTTON, SUBMIT_BUTTON_TIMEOUT)
        .await?
        .ok_or(SubmitError::ElementNotFound {
            what: "Submit button",
            waited: SUBMIT_BUTTON_TIMEOUT,
        })?;
    page.scroll_into_view(&submit).await?;
    delay.pause().await;
    page.click(&submit).await?;
    tracing::debug!(application_id = app.id, "Submit clicked");

    delay.hold(CONFIRMATION_WAIT).await;
    let after = page.content().await?;
    check_outcome(&after)?;
    Ok(boosted)
}

/// Sets the boost bid to the first-place amount shown next to it. `Ok(None)`
/// when the page offers no boost control.
async fn set_boost(page: &dyn BrowserPage, delay: &HumanDelay) -> Result<Option<String>> {
    let Some(section) = page.wait_for(BOOST_SECTION, BOOST_SECTION_TIMEOUT).await? else {
        return Ok(None);
    };
    page.scroll_into_view(&section).await?;
    delay.pause().await;

    let Some(input) = page.wait_for(BOOST_INPUT, BOOST_INPUT_TIMEOUT).await? else {
        return Ok(None);
    };
    page.click(&input).await?;
    delay.pause().await;

    let value = match page.wait_for(BOOST_MAX_LABEL, BOOST_LABEL_TIMEOUT).await? {
        Some(label) => boost_value_from_label(&page.text(&label).await?),
        None => None,
    }
    .unwrap_or_else(|| DEFAULT_BOOST.to_string());

    page.fill(&input, &value).await?;
    Ok(Some(value))
}
