// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Line-oriented parser for the kernel's `rls` runlist dump.
//!
//! The format is, per runlist:
//!
//! ```text
//! Node <decimal>, gpu_id <hex>:
//!   <8-hex-addr>: <dword> <dword> ...
//!   <8-hex-addr>: <dword> ...
//! ```
//!
//! The parser is a single-pass state machine: `Node` scans for a node header,
//! `Data` accumulates dwords until a line stops matching the address-colon
//! shape, which ends the runlist without consuming that line so the next call
//! resumes there.

use log::error;
use regex::Regex;

use crate::{Error, Result};

/// One extracted runlist: its ids and the flattened dword stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRunlist {
    pub node_id: u32,
    pub gpu_id: u32,
    pub dwords: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Node,
    Data,
}

/// Incremental runlist extractor over one dump text.
pub struct RlsParser<'a> {
    text: &'a str,
    pos: usize,
    target: Option<(u32, u32)>,
    node_re: Regex,
    data_re: Regex,
    dword_re: Regex,
}

impl<'a> RlsParser<'a> {
    /// Parser matching every node in the dump.
    pub fn new(text: &'a str) -> RlsParser<'a> {
        RlsParser {
            text,
            pos: 0,
            target: None,
            node_re: Regex::new(r"^\s*Node (\d+), gpu_id ([0-9a-fA-F]+):\s*$").expect("node regex"),
            data_re: Regex::new(r"^\s*[0-9a-fA-F]{8}:").expect("data regex"),
            dword_re: Regex::new(r"[0-9a-fA-F]{8}").expect("dword regex"),
        }
    }

    /// Parser matching only the given `(node, gpu)` pair.
    pub fn for_node(text: &'a str, node_id: u32, gpu_id: u32) -> RlsParser<'a> {
        let mut parser = RlsParser::new(text);
        parser.target = Some((node_id, gpu_id));
        parser
    }

    fn parse_node_line(&self, line: &str) -> Result<Option<(u32, u32)>> {
        let caps = match self.node_re.captures(line) {
            Some(c) => c,
            None => return Ok(None),
        };
        let node_id = caps[1]
            .parse::<u32>()
            .map_err(|e| Error::Generic(format!("bad node id in {:?}: {}", line, e)))?;
        let gpu_id = u32::from_str_radix(&caps[2], 16)
            .map_err(|e| Error::Generic(format!("bad gpu id in {:?}: {}", line, e)))?;
        Ok(Some((node_id, gpu_id)))
    }

    fn parse_data_line(&self, line: &str) -> Result<Option<Vec<u32>>> {
        let m = match self.data_re.find(line) {
            Some(m) => m,
            None => return Ok(None),
        };
        let mut dwords = Vec::new();
        for tok in self.dword_re.find_iter(&line[m.end()..]) {
            let dword = u32::from_str_radix(tok.as_str(), 16).map_err(|e| {
                error!("malformed data line {:?}", line);
                Error::Generic(format!("bad dword in {:?}: {}", line, e))
            })?;
            dwords.push(dword);
        }
        Ok(Some(dwords))
    }

    /// Extracts the next runlist, or `None` once the dump is exhausted.
    ///
    /// On a match the cursor lands just past the last data line, so repeated
    /// calls walk the dump runlist by runlist.
    pub fn next_runlist(&mut self) -> Result<Option<RawRunlist>> {
        let mut state = State::Node;
        let mut node_id = 0u32;
        let mut gpu_id = 0u32;
        let mut dwords: Vec<u32> = Vec::new();
        let mut cursor = self.pos;

        while cursor < self.text.len() {
            let line_end = self.text[cursor..]
                .find('\n')
                .map(|i| cursor + i)
                .unwrap_or(self.text.len());
            let line = &self.text[cursor..line_end];
            let next = (line_end + 1).min(self.text.len());
            match state {
                State::Node => {
                    if let Some((n, g)) = self.parse_node_line(line)? {
                        let wanted = self.target.map_or(true, |(tn, tg)| tn == n && tg == g);
                        if wanted {
                            node_id = n;
                            gpu_id = g;
                            state = State::Data;
                        }
                    }
                    cursor = next;
                }
                State::Data => match self.parse_data_line(line)? {
                    Some(mut line_dwords) => {
                        dwords.append(&mut line_dwords);
                        cursor = next;
                    }
                    None => {
                        // End of this runlist; the non-matching line is left
                        // for the next call.
                        self.pos = cursor;
                        if dwords.is_empty() {
                            return Ok(None);
                        }
                        return Ok(Some(RawRunlist {
                            node_id,
                            gpu_id,
                            dwords,
                        }));
                    }
                },
            }
        }

        self.pos = self.text.len();
        if state == State::Data && !dwords.is_empty() {
            Ok(Some(RawRunlist {
                node_id,
                gpu_id,
                dwords,
            }))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_line() {
        let p = RlsParser::new("");
        assert_eq!(
            p.parse_node_line("Node 2, gpu_id c9e7:").unwrap(),
            Some((2, 0xc9e7))
        );
        assert_eq!(
            p.parse_node_line("Node 999999, gpu_id ffff:").unwrap(),
            Some((999999, 0xffff))
        );
        assert_eq!(p.parse_node_line("Node 2, gpu_id QQQQQQ:").unwrap(), None);
        assert_eq!(p.parse_node_line("Node 2, cpu_id c9e7:").unwrap(), None);
        assert_eq!(p.parse_node_line("Node A, gpu_id c9e7:").unwrap(), None);
        assert_eq!(p.parse_node_line("").unwrap(), None);
        assert_eq!(
            p.parse_node_line("00000020: 00000000 00000000").unwrap(),
            None
        );
    }

    #[test]
    fn data_line() {
        let p = RlsParser::new("");
        let dwords = p
            .parse_data_line(
                "  00000020: 00000000 00000000 00000000 00000000 00000000 c005a200 28000010 00004a80 ",
            )
            .unwrap()
            .unwrap();
        assert_eq!(dwords, vec![0, 0, 0, 0, 0, 0xc005a200, 0x28000010, 0x00004a80]);
        assert_eq!(p.parse_data_line("ffffffff:00000000").unwrap().unwrap(), vec![0]);
        assert_eq!(p.parse_data_line("00000000:").unwrap().unwrap(), vec![]);
        assert_eq!(p.parse_data_line("0000fff:").unwrap(), None);
        assert_eq!(p.parse_data_line("0000ffff1: 00000000").unwrap(), None);
        assert_eq!(p.parse_data_line("0000ffff 00000000").unwrap(), None);
        assert_eq!(p.parse_data_line("0000GGGG: 00000000").unwrap(), None);
        assert_eq!(p.parse_data_line("").unwrap(), None);
    }

    const TWO_NODES: &str = "\
Node 1, gpu_id 1576:
  00000000: c005a200 28000010 00008800 0171a000 00000000 0ce9c008 00007f4c
Node 2, gpu_id c9e7:
  00000000: c005a200 28000010 00006940 0171f000 00000000 0ce9a008 00007f4c
";

    #[test]
    fn walks_runlists_in_order() {
        let mut p = RlsParser::new(TWO_NODES);
        let first = p.next_runlist().unwrap().unwrap();
        assert_eq!((first.node_id, first.gpu_id), (1, 0x1576));
        assert_eq!(first.dwords.len(), 7);
        let second = p.next_runlist().unwrap().unwrap();
        assert_eq!((second.node_id, second.gpu_id), (2, 0xc9e7));
        assert_eq!(second.dwords[2], 0x00006940);
        assert!(p.next_runlist().unwrap().is_none());
    }

    #[test]
    fn targeted_search_skips_other_nodes() {
        let mut p = RlsParser::for_node(TWO_NODES, 2, 0xc9e7);
        let rl = p.next_runlist().unwrap().unwrap();
        assert_eq!(rl.node_id, 2);
        assert_eq!(rl.dwords[2], 0x00006940);
        assert!(p.next_runlist().unwrap().is_none());
    }

    #[test]
    fn leading_junk_is_skipped() {
        let text = format!("JUNK\n****\n\n{}", TWO_NODES);
        let mut p = RlsParser::new(&text);
        let rl = p.next_runlist().unwrap().unwrap();
        assert_eq!(rl.node_id, 1);
    }

    #[test]
    fn header_without_data_ends_the_walk() {
        let mut p = RlsParser::new("Node 1, gpu_id 1576:\nNode 2, gpu_id c9e7:\n");
        assert!(p.next_runlist().unwrap().is_none());
    }
}
