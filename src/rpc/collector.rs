//! Response collectors: fold per-target responses into one result.
//!
//! A collector sees every accepted response exactly once through
//! [`ResponseCollector::add_response`]. Returning `Ok(Some(_))` completes the
//! request immediately; returning an error fails it. If every target answered
//! (or left) without a short-circuit, [`ResponseCollector::finish`] is called
//! exactly once.

use crate::error::{Error, RemoteError, Result};
use crate::rpc::message::{Response, ResponseValue};
use crate::types::Address;
use std::collections::HashMap;

/// Aggregates responses of one request.
pub trait ResponseCollector<T>: Send {
    /// Accept one target's response. `Ok(Some(_))` short-circuits.
    fn add_response(&mut self, sender: Address, response: Response) -> Result<Option<T>>;

    /// Produce the result once every target answered.
    fn finish(&mut self) -> Result<T>;
}

fn remote_failure(sender: Address, error: RemoteError) -> Error {
    Error::Remote(RemoteError::wrapping(
        Some(sender),
        format!("command failed on {}", sender),
        error,
    ))
}

/// Collects every response into a map keyed by sender.
///
/// Exceptions fail the request. Leavers fail it with [`Error::Suspect`]
/// unless leavers are ignored.
#[derive(Debug, Default)]
pub struct MapResponseCollector {
    responses: HashMap<Address, Response>,
    ignore_leavers: bool,
}

impl MapResponseCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip leavers instead of failing.
    pub fn ignoring_leavers() -> Self {
        Self {
            responses: HashMap::new(),
            ignore_leavers: true,
        }
    }
}

impl ResponseCollector<HashMap<Address, Response>> for MapResponseCollector {
    fn add_response(
        &mut self,
        sender: Address,
        response: Response,
    ) -> Result<Option<HashMap<Address, Response>>> {
        match response {
            Response::Exception(error) => return Err(remote_failure(sender, error)),
            Response::Leaver if self.ignore_leavers => {}
            Response::Leaver => return Err(Error::Suspect(sender)),
            other => {
                self.responses.insert(sender, other);
            }
        }
        Ok(None)
    }

    fn finish(&mut self) -> Result<HashMap<Address, Response>> {
        Ok(std::mem::take(&mut self.responses))
    }
}

/// Expects a single target. Completes with its response, failing on an
/// exception or a leaver.
#[derive(Debug, Default)]
pub struct SingleResponseCollector;

impl ResponseCollector<Response> for SingleResponseCollector {
    fn add_response(&mut self, sender: Address, response: Response) -> Result<Option<Response>> {
        match response {
            Response::Exception(error) => Err(remote_failure(sender, error)),
            Response::Leaver => Err(Error::Suspect(sender)),
            other => Ok(Some(other)),
        }
    }

    fn finish(&mut self) -> Result<Response> {
        Err(Error::NoValidResponse)
    }
}

/// Completes with the first response as-is, whatever it is.
#[derive(Debug, Default)]
pub struct PassthroughResponseCollector;

impl ResponseCollector<Response> for PassthroughResponseCollector {
    fn add_response(&mut self, _sender: Address, response: Response) -> Result<Option<Response>> {
        Ok(Some(response))
    }

    fn finish(&mut self) -> Result<Response> {
        Err(Error::NoValidResponse)
    }
}

/// Completes with the first successful value. Exceptions, leavers and
/// unsuccessful responses are tolerated while other targets may still succeed.
#[derive(Debug, Default)]
pub struct FirstSuccessCollector {
    first_exception: Option<(Address, RemoteError)>,
}

impl FirstSuccessCollector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResponseCollector<ResponseValue> for FirstSuccessCollector {
    fn add_response(&mut self, sender: Address, response: Response) -> Result<Option<ResponseValue>> {
        match response {
            Response::Success(value) => return Ok(Some(value)),
            Response::Exception(error) => {
                if self.first_exception.is_none() {
                    self.first_exception = Some((sender, error));
                }
            }
            Response::Unsuccessful | Response::Leaver => {}
        }
        Ok(None)
    }

    fn finish(&mut self) -> Result<ResponseValue> {
        match self.first_exception.take() {
            Some((sender, error)) => Err(remote_failure(sender, error)),
            None => Err(Error::NoValidResponse),
        }
    }
}

/// Ignores response values; fails on the first exception.
#[derive(Debug, Default)]
pub struct VoidResponseCollector {
    ignore_leavers: bool,
}

impl VoidResponseCollector {
    /// Fail with [`Error::Suspect`] when a target leaves.
    pub fn valid_only() -> Self {
        Self {
            ignore_leavers: false,
        }
    }

    /// Tolerate leavers.
    pub fn ignoring_leavers() -> Self {
        Self {
            ignore_leavers: true,
        }
    }
}

impl ResponseCollector<()> for VoidResponseCollector {
    fn add_response(&mut self, sender: Address, response: Response) -> Result<Option<()>> {
        match response {
            Response::Exception(error) => Err(remote_failure(sender, error)),
            Response::Leaver if !self.ignore_leavers => Err(Error::Suspect(sender)),
            _ => Ok(None),
        }
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn addr(id: u64) -> Address {
        Address::new(id)
    }

    #[test]
    fn test_map_collector() {
        let mut collector = MapResponseCollector::new();
        assert!(collector
            .add_response(addr(1), Response::empty())
            .unwrap()
            .is_none());
        assert!(collector
            .add_response(addr(2), Response::Unsuccessful)
            .unwrap()
            .is_none());

        let map = collector.finish().unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map[&addr(2)], Response::Unsuccessful);
    }

    #[test]
    fn test_map_collector_leavers() {
        let mut strict = MapResponseCollector::new();
        assert!(matches!(
            strict.add_response(addr(3), Response::Leaver),
            Err(Error::Suspect(a)) if a == addr(3)
        ));

        let mut lenient = MapResponseCollector::ignoring_leavers();
        assert!(lenient.add_response(addr(3), Response::Leaver).unwrap().is_none());
        assert!(lenient.finish().unwrap().is_empty());
    }

    #[test]
    fn test_exception_keeps_root_cause() {
        let mut collector = VoidResponseCollector::ignoring_leavers();
        let cause = RemoteError::new(Some(addr(2)), "disk full");
        let err = collector
            .add_response(addr(2), Response::Exception(cause.clone()))
            .unwrap_err();
        assert_eq!(err.root_cause(), Some(&cause));
    }

    #[test]
    fn test_first_success_short_circuits() {
        let mut collector = FirstSuccessCollector::new();
        assert!(collector
            .add_response(addr(1), Response::Unsuccessful)
            .unwrap()
            .is_none());
        let value = collector
            .add_response(
                addr(2),
                Response::Success(ResponseValue::Value(Some(Bytes::from_static(b"v")))),
            )
            .unwrap();
        assert_eq!(value, Some(ResponseValue::Value(Some(Bytes::from_static(b"v")))));
    }

    #[test]
    fn test_first_success_reports_exception_when_nothing_succeeded() {
        let mut collector = FirstSuccessCollector::new();
        collector.add_response(addr(1), Response::Leaver).unwrap();
        collector
            .add_response(addr(2), Response::Exception(RemoteError::new(None, "boom")))
            .unwrap();
        assert!(matches!(collector.finish(), Err(Error::Remote(_))));

        let mut empty = FirstSuccessCollector::new();
        assert!(matches!(empty.finish(), Err(Error::NoValidResponse)));
    }

    #[test]
    fn test_single_and_passthrough() {
        let mut single = SingleResponseCollector;
        assert_eq!(
            single.add_response(addr(1), Response::Unsuccessful).unwrap(),
            Some(Response::Unsuccessful)
        );
        assert!(single.add_response(addr(1), Response::Leaver).is_err());

        let mut passthrough = PassthroughResponseCollector;
        assert_eq!(
            passthrough.add_response(addr(1), Response::Leaver).unwrap(),
            Some(Response::Leaver)
        );
    }
}
