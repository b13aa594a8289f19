// Copyright (c) 2025, The AMQP Transport Authors
// MIT License
// All rights reserved.

//! # Trace Context Propagation
//!
//! Injects the current trace context into outgoing message headers before
//! they are encoded onto the wire, and extracts it from the delivery's
//! header table to parent the consumer-side span.

use lapin::{
    types::{AMQPValue, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};

/// Writes trace context into the plain header map of an outgoing message.
struct HeaderInjector<'a> {
    headers: &'a mut BTreeMap<String, String>,
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

/// Reads trace context back out of a delivery's native header table.
struct TableExtractor<'a> {
    headers: &'a BTreeMap<ShortString, AMQPValue>,
}

impl Extractor for TableExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|value| {
            if let AMQPValue::LongString(value) = value {
                std::str::from_utf8(value.as_bytes()).ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(ShortString::as_str).collect()
    }
}

/// Injects the given context into the message headers.
///
/// Runs before wire encoding; the injected keys ride in the opaque part of
/// the header table like any other caller-supplied header.
pub(crate) fn inject_context(ctx: &Context, headers: &mut BTreeMap<String, String>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector { headers })
    });
}

/// Extracts the upstream context from a delivery and starts a consumer span.
pub(crate) fn consumer_span(
    properties: &BasicProperties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let headers = properties.headers().clone().unwrap_or_default();
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&TableExtractor {
            headers: headers.inner(),
        })
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
