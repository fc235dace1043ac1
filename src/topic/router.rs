//! Registration-ordered topic router.
//!
//! The router is generic over the handler type so the ingest pipeline can
//! store trait objects while tests use plain values. Lookup is a linear scan;
//! the route table holds a handful of category filters, not one entry per
//! machine.

use tracing::debug;

use super::{FilterError, TopicFilter};

#[derive(Debug)]
struct Route<H> {
    filter: TopicFilter,
    handler: H,
}

#[derive(Debug)]
pub struct TopicRouter<H> {
    routes: Vec<Route<H>>,
}

impl<H> Default for TopicRouter<H> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<H> TopicRouter<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `filter` and appends the route. Fails with the parse error
    /// without touching the table.
    pub fn register(&mut self, filter: &str, handler: H) -> Result<(), FilterError> {
        let filter = TopicFilter::parse(filter)?;
        self.register_filter(filter, handler);
        Ok(())
    }

    pub fn register_filter(&mut self, filter: TopicFilter, handler: H) {
        debug!("Registering route #{} for '{}'", self.routes.len(), filter);
        self.routes.push(Route { filter, handler });
    }

    /// All handlers whose filter covers `topic`, in registration order.
    pub fn matches(&self, topic: &str) -> Vec<&H> {
        self.routes
            .iter()
            .filter(|route| route.filter.matches(topic))
            .map(|route| &route.handler)
            .collect()
    }

    pub fn filters(&self) -> impl Iterator<Item = &TopicFilter> {
        self.routes.iter().map(|route| &route.filter)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
