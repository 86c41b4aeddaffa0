use std::path::PathBuf;

use crate::agent::engine::{AutoContinue, Discussion, RoundControl};
use crate::models::LanguageModel;
use crate::session::{Session, SessionMeta, Turn};
use crate::settings::Settings;
use crate::storage::SessionStore;

pub struct RunContext<'a, S: SessionStore + ?Sized> {
    pub store: &'a S,
    pub model: &'a dyn LanguageModel,
    pub settings: &'a Settings,
}

#[derive(Debug)]
pub struct SavedSession {
    pub session: Session,
    pub path: PathBuf,
}

/// Runs one discussion and writes its log. Nothing is written unless every
/// turn succeeded.
pub async fn run_discussion<S: SessionStore + ?Sized>(
    ctx: RunContext<'_, S>,
    topic: &str,
    on_turn: impl FnMut(&Turn) + Send,
) -> anyhow::Result<SavedSession> {
    run_discussion_with(ctx, topic, on_turn, &mut AutoContinue).await
}

/// Like [`run_discussion`], asking `control` between rounds.
pub async fn run_discussion_with<S: SessionStore + ?Sized>(
    ctx: RunContext<'_, S>,
    topic: &str,
    on_turn: impl FnMut(&Turn) + Send,
    control: &mut dyn RoundControl,
) -> anyhow::Result<SavedSession> {
    ctx.settings.require_api_key()?;
    let mut session = Session::new(topic.trim(), SessionMeta::from(ctx.settings));
    tracing::info!(session = %session.id, model = %ctx.settings.model, "discussion started");
    let transcript = Discussion::from_settings(ctx.model, ctx.settings).run_with(topic, on_turn, control).await?;

    for turn in transcript.turns {
        session.push_turn(turn);
    }
    session.rounds = transcript.rounds;
    session.concluded = transcript.concluded;
    session.interjections = transcript.interjections;
    if !session.concluded {
        tracing::warn!(session = %session.id, "judge did not close the discussion");
    }

    let path = ctx.store.save(&session).await?;
    Ok(SavedSession { session, path })
}
