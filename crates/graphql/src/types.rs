//! GraphQL type definitions.

use async_graphql::{EmptyMutation, EmptySubscription, Schema};

use crate::schema::IndexQuery;

/// The GraphQL schema type served by Tally.
pub type TallySchema = Schema<IndexQuery, EmptyMutation, EmptySubscription>;
