use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};

/// Handles a shell's PTY: the master side, its writer and a killer for the
/// child. The reader and the child itself are handed out at spawn time so
/// dedicated threads can block on them.
pub(crate) struct PtyHandler {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

/// Pieces of a freshly spawned shell
pub(crate) struct SpawnedPty {
    pub handler: PtyHandler,
    pub reader: Box<dyn Read + Send>,
    pub child: Box<dyn Child + Send + Sync>,
}

impl PtyHandler {
    /// Open a PTY of the given size and spawn `command` on its slave side
    pub fn spawn(command: CommandBuilder, cols: u16, rows: u16) -> Result<SpawnedPty> {
        let pty_system = native_pty_system();

        let pty_pair = pty_system
            .openpty(pty_size(cols, rows))
            .context("Failed to open PTY")?;

        let master = pty_pair.master;
        let slave = pty_pair.slave;

        let child = slave
            .spawn_command(command)
            .context("Failed to spawn command in PTY")?;
        // Reader must see EOF once the child and its descendants close the terminal
        drop(slave);

        let reader = master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;
        let writer = master
            .take_writer()
            .context("Failed to take PTY writer")?;
        let killer = child.clone_killer();

        Ok(SpawnedPty {
            handler: Self {
                master,
                writer,
                killer,
            },
            reader,
            child,
        })
    }

    /// Write raw bytes to the PTY
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer
            .write_all(data)
            .context("Failed to write to PTY")?;
        self.writer.flush().context("Failed to flush PTY writer")?;
        Ok(())
    }

    /// Resize the PTY
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .resize(pty_size(cols, rows))
            .context("Failed to resize PTY")?;
        Ok(())
    }

    /// Kill the child process; fails if it already exited
    pub fn kill(&mut self) -> Result<()> {
        self.killer
            .kill()
            .context("Failed to kill child process")?;
        Ok(())
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}
