// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Weighted-without-replacement host selection: hosts with a higher
//! declared slot limit are more likely to be picked first, but a host is
//! never offered twice within the same compilation attempt.

use rand::distributions::{Distribution, WeightedIndex};
use rand::thread_rng;

use crate::host::Host;

pub struct RemoteHostSelector {
    hosts: Vec<Host>,
    limits: Vec<usize>,
    tries_remaining: Option<usize>,
}

impl RemoteHostSelector {
    /// `hosts` must not contain any local host; `tries` caps the number of
    /// hosts offered before selection gives up (`None` exhausts the whole
    /// list).
    pub fn new(hosts: Vec<Host>, tries: Option<usize>) -> Result<RemoteHostSelector, String> {
        if hosts.iter().any(Host::is_local) {
            return Err("selecting localhost via the remote host selector is not permitted".into());
        }
        if let Some(0) = tries {
            return Err("amount of tries must be greater than 0".into());
        }

        let hosts: Vec<Host> = hosts.into_iter().filter(|h| h.limit > 0).collect();
        let limits = hosts.iter().map(|h| h.limit).collect();

        Ok(RemoteHostSelector { hosts, limits, tries_remaining: tries })
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl Iterator for RemoteHostSelector {
    type Item = Host;

    fn next(&mut self) -> Option<Host> {
        if self.hosts.is_empty() {
            return None;
        }
        if let Some(tries) = &mut self.tries_remaining {
            if *tries == 0 {
                return None;
            }
            *tries -= 1;
        }

        let dist = WeightedIndex::new(&self.limits).expect("limits are all > 0 by construction");
        let index = dist.sample(&mut thread_rng());

        self.limits.remove(index);
        Some(self.hosts.remove(index))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::Host;

    #[test]
    fn yields_every_host_exactly_once() {
        let hosts =
            vec![Host::parse("a/3").unwrap(), Host::parse("b/1").unwrap(), Host::parse("c/5").unwrap()];
        let selector = RemoteHostSelector::new(hosts, None).unwrap();
        let picked: Vec<Host> = selector.collect();
        assert_eq!(picked.len(), 3);
    }

    #[test]
    fn rejects_localhost() {
        let hosts = vec![Host::localhost_with_limit(4)];
        assert!(RemoteHostSelector::new(hosts, None).is_err());
    }

    #[test]
    fn respects_tries_limit() {
        let hosts =
            vec![Host::parse("a/3").unwrap(), Host::parse("b/1").unwrap(), Host::parse("c/5").unwrap()];
        let selector = RemoteHostSelector::new(hosts, Some(2)).unwrap();
        assert_eq!(selector.count(), 2);
    }

    #[test]
    fn zero_tries_rejected() {
        assert!(RemoteHostSelector::new(vec![Host::parse("a/3").unwrap()], Some(0)).is_err());
    }
}
