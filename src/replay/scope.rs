//! Read-only view of everything one participant replays against

use crate::comm::{CommHandle, Endpoint, Team};
use crate::config::AnalysisConfig;
use crate::context::ReplayContext;
use crate::defs::{CommId, Communicator, Definitions, Location};
use crate::error::{ReplayError, Result};
use crate::trace::LocalTrace;

#[derive(Clone, Copy)]
pub struct ReplayScope<'a> {
    pub defs: &'a Definitions,
    /// Process-level communicator, built once per job
    pub world: &'a Communicator,
    pub config: &'a AnalysisConfig,
    pub trace: &'a LocalTrace,
    pub location: Location,
    /// Present on master threads only; they carry all process-level traffic
    pub endpoint: Option<&'a Endpoint>,
    pub team: &'a Team,
}

impl<'a> ReplayScope<'a> {
    pub fn process(&self) -> usize {
        self.location.process
    }

    pub fn thread(&self) -> usize {
        self.location.thread
    }

    pub fn communicator(&self, id: CommId) -> Result<&'a Communicator> {
        if id == CommId::WORLD {
            Ok(self.world)
        } else {
            self.defs.communicator(id)
        }
    }

    fn endpoint(&self) -> Result<&'a Endpoint> {
        self.endpoint.ok_or_else(|| {
            ReplayError::malformed(
                self.trace.location(),
                "process-level communication on a non-master thread",
            )
        })
    }

    /// Bind this participant's endpoint to communicator `id`
    pub fn bind(&self, id: CommId) -> Result<CommHandle<'a>> {
        self.endpoint()?.bind(self.communicator(id)?)
    }

    pub fn bind_comm(&self, comm: &'a Communicator) -> Result<CommHandle<'a>> {
        self.endpoint()?.bind(comm)
    }

    /// Coordination point before a collective: stop every member together
    /// if any member holds unrecovered callback errors
    pub fn health_check(&self, comm: &CommHandle<'_>, ctx: &ReplayContext) -> Result<()> {
        check_health(comm, ctx)
    }

    /// Team variant of [`Self::health_check`]; returns the gathered values
    pub fn team_exchange<T: Clone + Send + 'static>(&self, ctx: &ReplayContext, value: T) -> Result<Vec<T>> {
        let gathered = self.team.allgather(self.thread(), (ctx.has_errors(), value))?;
        let failing = gathered.iter().filter(|(err, _)| *err).count();
        if failing > 0 {
            return Err(ReplayError::HealthCheck(failing));
        }
        Ok(gathered.into_iter().map(|(_, v)| v).collect())
    }
}

/// Allreduce of "holds errors" over the members of `comm`
pub(crate) fn check_health(comm: &CommHandle<'_>, ctx: &ReplayContext) -> Result<()> {
    let failing = comm.allreduce(ctx.has_errors() as usize, |a, b| a + b)?;
    if failing > 0 {
        return Err(ReplayError::HealthCheck(failing));
    }
    Ok(())
}
