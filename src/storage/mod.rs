mod categories;
mod episodes;
mod podcasts;
mod schema;
mod types;

pub(crate) use categories::set_podcast_categories;
pub use categories::{CategoryCache, CategoryMap};
pub(crate) use episodes::sync_episodes;
pub(crate) use podcasts::{
    apply_refresh, find_duplicate, mark_duplicate, resolve_canonical, stamp_attempt,
    PodcastRefresh,
};
pub use podcasts::RetryState;
pub use schema::Database;
pub use types::{DatabaseError, Episode, EpisodeSync, Podcast};
