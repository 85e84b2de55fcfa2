use crate::Profile;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("unknown worker profile: {0}")]
    UnknownProfile(String),
    #[error("unknown queue stream: {0}")]
    UnknownStream(String),
}

/// Static mapping from profiles to streams and from streams to consumer
/// groups. One stream per profile keeps heavy jobs from starving light ones.
#[derive(Clone, Debug)]
pub struct StreamRouting {
    routes: Vec<(Profile, &'static str, &'static str)>,
}

impl Default for StreamRouting {
    fn default() -> Self {
        Self {
            routes: vec![
                (Profile::Light, "queue:light", "workers-light"),
                (Profile::Torch, "queue:torch", "workers-torch"),
            ],
        }
    }
}

impl StreamRouting {
    pub fn stream_for_profile(&self, profile: Profile) -> &'static str {
        // Both profiles are always present in the default table.
        self.routes
            .iter()
            .find(|(candidate, _, _)| *candidate == profile)
            .map(|(_, stream, _)| *stream)
            .unwrap_or("queue:light")
    }

    pub fn group_for_stream(&self, stream: &str) -> Result<&'static str, RoutingError> {
        self.routes
            .iter()
            .find(|(_, candidate, _)| *candidate == stream)
            .map(|(_, _, group)| *group)
            .ok_or_else(|| RoutingError::UnknownStream(stream.to_string()))
    }

    pub fn profile_for_stream(&self, stream: &str) -> Result<Profile, RoutingError> {
        self.routes
            .iter()
            .find(|(_, candidate, _)| *candidate == stream)
            .map(|(profile, _, _)| *profile)
            .ok_or_else(|| RoutingError::UnknownStream(stream.to_string()))
    }

    pub fn streams(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.routes.iter().map(|(_, stream, _)| *stream)
    }
}
