/*
Copyright (c) 2020 Pierre Marijon <pierre@marijon.fr>

Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:

The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.

THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
 */

/* std use */
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/* crate use */
use anyhow::Result;
use log::{debug, info};
use structopt::StructOpt;

/* local use */
use comptoir::cli;
use comptoir::error::Error;
use comptoir::graph::Graph;
use comptoir::kmer::Width;
use comptoir::progress::{CancelToken, Progress};

/// Progress goes to the log, one line every million items.
struct LogProgress {
    label: Mutex<String>,
    done: AtomicU64,
}

const PROGRESS_GRAIN: u64 = 1_000_000;

impl Progress for LogProgress {
    fn start(&self, label: &str, _total: u64) {
        if let Ok(mut current) = self.label.lock() {
            *current = label.to_string();
        }
        self.done.store(0, Ordering::Relaxed);
    }

    fn step(&self, n: u64) {
        let done = self.done.fetch_add(n, Ordering::Relaxed) + n;
        if done / PROGRESS_GRAIN != (done - n) / PROGRESS_GRAIN {
            if let Ok(label) = self.label.lock() {
                debug!("{}: {} items", label, done);
            }
        }
    }

    fn stop(&self) {
        if let Ok(label) = self.label.lock() {
            debug!("{}: done", label);
        }
    }
}

fn main() {
    let params = cli::Command::from_args();

    env_logger::builder().filter_level(params.log_level()).init();

    if let Err(error) = run(&params) {
        eprintln!("error: {}", error);
        if params.verbosity >= 1 {
            for cause in error.chain().skip(1) {
                eprintln!("  from: {}", cause);
            }
        }

        let code = error
            .downcast_ref::<Error>()
            .map(Error::exit_code)
            .unwrap_or(2);
        std::process::exit(code);
    }
}

fn run(params: &cli::Command) -> Result<()> {
    let options = params.to_options()?;
    let cancel = CancelToken::new();
    let progress = LogProgress {
        label: Mutex::new(String::new()),
        done: AtomicU64::new(0),
    };

    let (nb_nodes, k) = match Width::for_k(options.k)? {
        Width::W64 => {
            let graph = Graph::<u64>::create_with_progress(&options, &cancel, &progress)?;
            (graph.nb_nodes(), graph.k())
        }
        Width::W128 => {
            let graph = Graph::<u128>::create_with_progress(&options, &cancel, &progress)?;
            (graph.nb_nodes(), graph.k())
        }
    };

    info!("graph built: k = {}, {} nodes", k, nb_nodes);

    Ok(())
}
