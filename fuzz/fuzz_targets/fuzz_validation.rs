//! Fuzz target for request validation.
//!
//! Every validator must return `Ok` or `Err` for any input and never panic,
//! including on multi-byte characters around the length limits.
//!
//! # Running
//!
//! ```bash
//! cargo +nightly fuzz run fuzz_validation
//! cargo +nightly fuzz run fuzz_validation -- -max_total_time=60
//! ```

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use social_pipeline::models::CreatePostRequest;
use social_pipeline::validation::{
    MAX_CONTENT_LENGTH, MAX_PAGE_LIMIT, MIN_CONTENT_LENGTH, resolve_pagination,
    validate_create_post, validate_search_query,
};

#[derive(Debug, Arbitrary)]
struct Input<'a> {
    content: Option<&'a str>,
    media_ids: Option<Vec<&'a str>>,
    page: Option<&'a str>,
    limit: Option<&'a str>,
    query: Option<&'a str>,
}

fuzz_target!(|input: Input<'_>| {
    let request = CreatePostRequest {
        content: input.content.map(str::to_string),
        media_ids: input
            .media_ids
            .map(|ids| ids.into_iter().map(str::to_string).collect()),
    };
    if let Ok(post) = validate_create_post(request, "fuzz-user") {
        let length = post.content.chars().count();
        assert!((MIN_CONTENT_LENGTH..=MAX_CONTENT_LENGTH).contains(&length));
    }

    let (page, limit) = resolve_pagination(input.page, input.limit);
    assert!(page >= 1);
    assert!((1..=MAX_PAGE_LIMIT).contains(&limit));

    if let Ok(query) = validate_search_query(input.query) {
        assert!(!query.is_empty());
    }
});
