//! Pre-authored replies used when the remote service can't answer

use super::{BotReply, Emotion};
use rand::seq::SliceRandom;
use rand::Rng;

/// Returned without a network call when no credential is available
pub const NOT_CONFIGURED_REPLY: &str =
    "I can't find my words right now... someone needs to set up my connection first.";

/// Used when AI replies are switched off
pub const LOCAL_REPLY: &str = "I'm listening. Tell me more whenever you like.";

/// Substituted when a decoded reply carries no text
pub const UNCLEAR_REPLY: &str = "Sorry, I couldn't quite understand myself just now. Could you say that again?";

const FALLBACK_REPLIES: &[(&str, Emotion)] = &[
    ("Sorry... my head went a little foggy. Can you say that again?", Emotion::Hesitant),
    ("Hm, I lost my train of thought. Give me a second?", Emotion::Shy),
    ("I'm still here. I just need a moment to gather my words.", Emotion::Withdrawn),
    ("Let's take it slow. Tell me again when you're ready.", Emotion::Relaxed),
    ("Oh... I didn't quite catch that one.", Emotion::Neutral),
];

pub fn random_fallback() -> BotReply {
    fallback_with(&mut rand::thread_rng())
}

pub fn fallback_with<R: Rng + ?Sized>(rng: &mut R) -> BotReply {
    let (text, emotion) = FALLBACK_REPLIES
        .choose(rng)
        .copied()
        .unwrap_or(FALLBACK_REPLIES[0]);
    BotReply::new(text, emotion)
}
