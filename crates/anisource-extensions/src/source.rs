//! The content-provider contract every extension implements.

use async_trait::async_trait;

use crate::error::ExtensionError;
use crate::types::{
    AnimeDetails, AnimePage, Episode, ExtensionInfo, SearchFilters, VideoSource,
};

/// Contract entry points a script may define.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Search,
    GetLatest,
    GetPopular,
    GetAnimeDetails,
    GetEpisodes,
    GetVideoSources,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Self::Search,
        Self::GetLatest,
        Self::GetPopular,
        Self::GetAnimeDetails,
        Self::GetEpisodes,
        Self::GetVideoSources,
    ];

    /// Name of the global function implementing this operation.
    pub fn entry_point(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::GetLatest => "getLatest",
            Self::GetPopular => "getPopular",
            Self::GetAnimeDetails => "getAnimeDetails",
            Self::GetEpisodes => "getEpisodes",
            Self::GetVideoSources => "getVideoSources",
        }
    }
}

/// A content source the host can query.
///
/// Calls on one source are serialized; calls on different sources run in
/// parallel. A failing call never changes the source's registration state.
#[async_trait]
pub trait ExtensionSource: Send + Sync {
    fn info(&self) -> &ExtensionInfo;

    async fn search(
        &self,
        query: &str,
        page: u32,
        filters: &SearchFilters,
    ) -> Result<AnimePage, ExtensionError>;

    async fn get_latest(&self, page: u32) -> Result<AnimePage, ExtensionError>;

    async fn get_popular(&self, page: u32) -> Result<AnimePage, ExtensionError>;

    /// `None` when the script reports no details for `url`.
    async fn get_anime_details(&self, url: &str) -> Result<Option<AnimeDetails>, ExtensionError>;

    async fn get_episodes(&self, url: &str) -> Result<Vec<Episode>, ExtensionError>;

    async fn get_video_sources(&self, url: &str) -> Result<Vec<VideoSource>, ExtensionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_point_names() {
        let names: Vec<&str> = Operation::ALL.iter().map(|op| op.entry_point()).collect();
        assert_eq!(
            names,
            vec![
                "search",
                "getLatest",
                "getPopular",
                "getAnimeDetails",
                "getEpisodes",
                "getVideoSources"
            ]
        );
    }
}
