use crate::exec::{CommandExecutor, DELETE_FLAG, INSERT_FLAG, IptablesRunner};
use kf_core::{CommandError, PositioningError};
use tracing::{debug, info};

/// What a positioning pass did to the jump rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionOutcome {
    Inserted { index: usize },
    AlreadyPlaced,
    Repositioned { from: usize, to: usize },
}

impl PositionOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, PositionOutcome::AlreadyPlaced)
    }
}

/// Keeps `<shared> -j <chain> -m conntrack --ctstate NEW` below the
/// services jump in the shared chain.
pub struct ChainPositioner<'a, E> {
    runner: &'a IptablesRunner<E>,
    shared_chain: &'a str,
    services_chain: &'a str,
    chain: &'a str,
}

impl<'a, E: CommandExecutor> ChainPositioner<'a, E> {
    pub fn new(
        runner: &'a IptablesRunner<E>,
        shared_chain: &'a str,
        services_chain: &'a str,
        chain: &'a str,
    ) -> Self {
        Self {
            runner,
            shared_chain,
            services_chain,
            chain,
        }
    }

    /// Rule arguments of the canonical jump, without the chain.
    pub fn jump_rule(&self) -> Vec<String> {
        ["-j", self.chain, "-m", "conntrack", "--ctstate", "NEW"]
            .iter()
            .map(|a| a.to_string())
            .collect()
    }

    fn jump_args(&self, index: Option<usize>) -> Vec<String> {
        let mut args = vec![self.shared_chain.to_string()];
        if let Some(index) = index {
            args.push(index.to_string());
        }
        args.extend(self.jump_rule());
        args
    }

    /// 1-based line of the jump into `target` in the shared chain, 0 if none.
    pub async fn line_number(&self, target: &str) -> Result<usize, CommandError> {
        let listing = self.runner.list_command(Some(self.shared_chain));
        let matched = self.runner.grep(&listing, target).await?;
        Ok(matched
            .map(|out| parse_line_number(&out, target))
            .unwrap_or(0))
    }

    pub async fn jump_exists(&self) -> Result<bool, CommandError> {
        self.runner.check(&self.jump_args(None)).await
    }

    pub async fn position(&self) -> Result<PositionOutcome, PositioningError> {
        let services_line = self.line_number(self.services_chain).await.map_err(|source| {
            PositioningError::LineLookup {
                shared_chain: self.shared_chain.to_string(),
                chain: self.services_chain.to_string(),
                source,
            }
        })?;

        let exists = self
            .jump_exists()
            .await
            .map_err(|source| PositioningError::Check {
                chain: self.chain.to_string(),
                source,
            })?;

        if !exists {
            let index = services_line + 1;
            self.runner
                .run(INSERT_FLAG, &self.jump_args(Some(index)))
                .await
                .map_err(|source| PositioningError::Insert {
                    chain: self.chain.to_string(),
                    index,
                    source,
                })?;
            info!(
                chain = self.chain,
                shared_chain = self.shared_chain,
                index,
                "inserted jump rule"
            );
            return Ok(PositionOutcome::Inserted { index });
        }

        if services_line <= 1 {
            debug!(chain = self.chain, services_line, "jump rule needs no repositioning");
            return Ok(PositionOutcome::AlreadyPlaced);
        }

        let own_line = self.line_number(self.chain).await.map_err(|source| {
            PositioningError::LineLookup {
                shared_chain: self.shared_chain.to_string(),
                chain: self.chain.to_string(),
                source,
            }
        })?;

        if services_line < own_line {
            debug!(chain = self.chain, own_line, services_line, "jump rule already placed");
            return Ok(PositionOutcome::AlreadyPlaced);
        }

        info!(
            chain = self.chain,
            own_line,
            services_line,
            "jump rule precedes {}, moving it",
            self.services_chain
        );

        self.runner
            .run(DELETE_FLAG, &self.jump_args(None))
            .await
            .map_err(|source| PositioningError::Delete {
                chain: self.chain.to_string(),
                source,
            })?;

        // deleting our rule above the services jump shifted it up by one
        let index = services_line;
        self.runner
            .run(INSERT_FLAG, &self.jump_args(Some(index)))
            .await
            .map_err(|source| PositioningError::Reinsert {
                chain: self.chain.to_string(),
                index,
                source,
            })?;

        Ok(PositionOutcome::Repositioned {
            from: own_line,
            to: index,
        })
    }
}

/// Line number of the first `--line-numbers` row whose target is `target`.
pub fn parse_line_number(listing: &str, target: &str) -> usize {
    listing
        .lines()
        .find_map(|line| {
            let mut fields = line.split_whitespace();
            let num = fields.next()?.parse::<usize>().ok()?;
            (fields.next()? == target).then_some(num)
        })
        .unwrap_or(0)
}
