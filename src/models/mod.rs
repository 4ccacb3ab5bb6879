mod api;
mod event;
mod records;

pub use api::{
    ApiResponse, CreatePostRequest, Empty, HealthResponse, ListPostsQuery, MediaListPayload,
    PostListing, PostListingPayload, PostPayload, SearchPayload, SearchQuery, UploadPayload,
};
pub use event::{DomainEvent, POST_CREATED, POST_DELETED, PostCreated, PostDeleted};
pub use records::{MediaRecord, NewPost, Post, SearchDocument};
