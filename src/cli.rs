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
use std::path::PathBuf;

/* crate use */
use structopt::StructOpt;

/* local use */
use crate::config::{AbundanceMin, BloomKind, DebloomKind, Options, SolidityKind};
use crate::error::Error;
use crate::minimizer::MinimizerType;

#[derive(StructOpt, Debug)]
#[structopt(
    version = "0.1",
    author = "Pierre Marijon <pierre@marijon.fr>",
    name = "comptoir",
    about = "Count kmers out-of-core and build a compacted de Bruijn graph."
)]
pub struct Command {
    #[structopt(
        short = "i",
        long = "in",
        required = true,
        help = "path of an input sequence file, repeat the flag for multiple banks"
    )]
    pub inputs: Vec<String>,

    #[structopt(
        short = "o",
        long = "out",
        required = true,
        help = "path of the output directory"
    )]
    pub output: String,

    #[structopt(
        short = "k",
        long = "kmer-size",
        default_value = "31",
        help = "kmer size, max value 63"
    )]
    pub kmer_size: u8,

    #[structopt(
        long = "abundance-min",
        default_value = "2",
        help = "minimal abundance of a solid kmer, or 'auto' for the histogram heuristic"
    )]
    pub abundance_min: String,

    #[structopt(long = "abundance-max", default_value = "65535")]
    pub abundance_max: u16,

    #[structopt(
        long = "solidity-kind",
        default_value = "sum",
        possible_values = &["sum", "all", "one"],
        help = "how multi bank abundances decide solidity"
    )]
    pub solidity: String,

    #[structopt(
        long = "max-memory",
        default_value = "2000",
        help = "memory budget in MB"
    )]
    pub max_memory: usize,

    #[structopt(
        long = "max-disk",
        default_value = "0",
        help = "scratch disk budget in MB, 0 means unbounded"
    )]
    pub max_disk: usize,

    #[structopt(
        long = "nb-cores",
        default_value = "0",
        help = "worker thread count, 0 means all available cores"
    )]
    pub nb_cores: usize,

    #[structopt(short = "m", long = "minimizer-size", default_value = "8")]
    pub minimizer_size: u8,

    #[structopt(
        long = "minimizer-type",
        default_value = "lex",
        possible_values = &["lex", "freq"]
    )]
    pub minimizer_type: String,

    #[structopt(
        long = "bloom",
        default_value = "cache",
        possible_values = &["none", "basic", "cache"]
    )]
    pub bloom: String,

    #[structopt(
        long = "debloom",
        default_value = "cascading",
        possible_values = &["none", "original", "cascading"]
    )]
    pub debloom: String,

    #[structopt(
        short = "v",
        long = "verbose",
        default_value = "1",
        help = "verbosity, 0 to 2"
    )]
    pub verbosity: u8,
}

impl Command {
    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbosity {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        }
    }

    pub fn to_options(&self) -> Result<Options, Error> {
        let abundance_min = if self.abundance_min == "auto" {
            AbundanceMin::Auto
        } else {
            AbundanceMin::Fixed(self.abundance_min.parse().map_err(|_| {
                Error::InvalidInput {
                    message: format!(
                        "abundance-min must be an integer or 'auto', got '{}'",
                        self.abundance_min
                    ),
                }
            })?)
        };

        let mut options = Options::new(
            self.inputs.iter().map(PathBuf::from).collect(),
            PathBuf::from(&self.output),
            self.kmer_size,
        );
        options.m = self.minimizer_size;
        options.abundance_min = abundance_min;
        options.abundance_max = self.abundance_max;
        options.max_memory_mb = self.max_memory;
        options.max_disk_mb = self.max_disk;
        options.nb_cores = self.nb_cores;
        options.minimizer_type = match self.minimizer_type.as_str() {
            "freq" => MinimizerType::Frequency,
            _ => MinimizerType::Lexicographic,
        };
        options.solidity = match self.solidity.as_str() {
            "all" => SolidityKind::All,
            "one" => SolidityKind::One,
            _ => SolidityKind::Sum,
        };
        options.bloom = match self.bloom.as_str() {
            "none" => BloomKind::None,
            "basic" => BloomKind::Basic,
            _ => BloomKind::Cache,
        };
        options.debloom = match self.debloom.as_str() {
            "none" => DebloomKind::None,
            "original" => DebloomKind::Original,
            _ => DebloomKind::Cascading,
        };

        options.validate()?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abundance_auto_and_fixed() {
        let command = Command::from_iter(&[
            "comptoir",
            "-i",
            "reads.fasta",
            "-o",
            "out",
            "--abundance-min",
            "auto",
        ]);
        let options = command.to_options().unwrap();
        assert_eq!(options.abundance_min, AbundanceMin::Auto);

        let command = Command::from_iter(&[
            "comptoir",
            "-i",
            "reads.fasta",
            "-o",
            "out",
            "--abundance-min",
            "5",
        ]);
        let options = command.to_options().unwrap();
        assert_eq!(options.abundance_min, AbundanceMin::Fixed(5));

        let command = Command::from_iter(&[
            "comptoir",
            "-i",
            "reads.fasta",
            "-o",
            "out",
            "--abundance-min",
            "many",
        ]);
        assert!(command.to_options().is_err());
    }

    #[test]
    fn multiple_banks() {
        let command = Command::from_iter(&[
            "comptoir", "-i", "a.fasta", "-i", "b.fasta", "-o", "out",
        ]);
        let options = command.to_options().unwrap();
        assert_eq!(options.inputs.len(), 2);
    }

    #[test]
    fn bad_kmer_size_is_user_error() {
        let command = Command::from_iter(&[
            "comptoir", "-i", "a.fasta", "-o", "out", "-k", "64",
        ]);
        let error = command.to_options().unwrap_err();
        assert_eq!(error.exit_code(), 1);
    }
}
