//! Transport over an MPI library
//!
//! Every communicator is backed by two MPI communicators, one per plane, so
//! collective traffic never matches a point to point receive. Messages
//! travel as byte strings framed by [`Packet::encode`]; a receive matches the
//! frame and sizes its buffer before taking it.
//!
//! The library is initialized once per process and finalized when the last
//! communicator using it is gone.

use std::mem::MaybeUninit;
use std::os::raw::c_int;
use std::process;
use std::ptr;
use std::rc::Rc;

use conv::ConvUtil;
use mpi_sys as ffi;
use mpi_sys::{MPI_Comm, MPI_Group, MPI_Message, MPI_Request, MPI_Status};
use tracing::{debug, error, trace};

use crate::error::{Error, Result};
use crate::topology::Rank;
use crate::transport::{Packet, Plane, Transfer, Transport};
use crate::Tag;

fn check(call: &'static str, code: c_int) -> Result<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(Error::Native { call, code })
    }
}

fn frame_len(frame: &[u8]) -> Result<c_int> {
    frame
        .len()
        .value_as::<c_int>()
        .map_err(|_| Error::Oversized { len: frame.len() })
}

/// What the launcher handed to this process
pub(crate) struct Launched {
    pub world: Native,
    pub size: Rank,
    pub rank: Rank,
    pub processor_name: String,
}

/// Initialize the library and read the calling process's place in the job.
pub(crate) fn initialize() -> Result<Launched> {
    let mut initialized: c_int = 0;
    check("MPI_Initialized", unsafe { ffi::MPI_Initialized(&mut initialized) })?;
    if initialized != 0 {
        return Err(Error::Configuration(
            "the MPI library has already been initialized".into(),
        ));
    }
    check("MPI_Init", unsafe {
        ffi::MPI_Init(ptr::null_mut(), ptr::null_mut())
    })?;
    let library = Rc::new(Library);

    let world = unsafe { ffi::RSMPI_COMM_WORLD };
    let mut rank: c_int = 0;
    let mut size: c_int = 0;
    check("MPI_Comm_rank", unsafe { ffi::MPI_Comm_rank(world, &mut rank) })?;
    check("MPI_Comm_size", unsafe { ffi::MPI_Comm_size(world, &mut size) })?;
    let processor_name = processor_name()?;

    let point_to_point = duplicate(world)?;
    let collective = duplicate(world).map_err(|err| {
        free(point_to_point);
        err
    })?;
    debug!(rank, size, node = %processor_name, "MPI initialized");
    Ok(Launched {
        world: Native {
            comms: Rc::new(Communicators {
                point_to_point,
                collective,
                library,
            }),
        },
        size,
        rank,
        processor_name,
    })
}

fn processor_name() -> Result<String> {
    let max = unsafe { ffi::RSMPI_MAX_PROCESSOR_NAME };
    let mut buf = vec![0u8; usize::try_from(max).unwrap_or(0) + 1];
    let mut len: c_int = 0;
    check("MPI_Get_processor_name", unsafe {
        ffi::MPI_Get_processor_name(buf.as_mut_ptr().cast(), &mut len)
    })?;
    buf.truncate(usize::try_from(len).unwrap_or(0));
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn duplicate(comm: MPI_Comm) -> Result<MPI_Comm> {
    let mut newcomm = MaybeUninit::<MPI_Comm>::uninit();
    check("MPI_Comm_dup", unsafe {
        ffi::MPI_Comm_dup(comm, newcomm.as_mut_ptr())
    })?;
    // SAFETY: set by the successful call above
    Ok(unsafe { newcomm.assume_init() })
}

fn free(mut comm: MPI_Comm) {
    let code = unsafe { ffi::MPI_Comm_free(&mut comm) };
    if code != 0 {
        error!(code, "MPI_Comm_free failed");
    }
}

/// Finalizes the library when dropped.
struct Library;

impl Drop for Library {
    fn drop(&mut self) {
        let code = unsafe { ffi::MPI_Finalize() };
        if code != 0 {
            error!(code, "MPI_Finalize failed");
        }
    }
}

struct Communicators {
    point_to_point: MPI_Comm,
    collective: MPI_Comm,
    library: Rc<Library>,
}

impl Communicators {
    fn get(&self, plane: Plane) -> MPI_Comm {
        match plane {
            Plane::PointToPoint => self.point_to_point,
            Plane::Collective => self.collective,
        }
    }
}

impl Drop for Communicators {
    fn drop(&mut self) {
        free(self.point_to_point);
        free(self.collective);
    }
}

/// One process's handle on a communicator of the MPI library
pub(crate) struct Native {
    comms: Rc<Communicators>,
}

fn receive_frame(comm: MPI_Comm, source: Rank, tag: Tag) -> Result<Packet> {
    let mut message = MaybeUninit::<MPI_Message>::uninit();
    let mut status = MaybeUninit::<MPI_Status>::uninit();
    check("MPI_Mprobe", unsafe {
        ffi::MPI_Mprobe(source, tag, comm, message.as_mut_ptr(), status.as_mut_ptr())
    })?;
    // SAFETY: both set by the successful MPI_Mprobe
    let (mut message, status) = unsafe { (message.assume_init(), status.assume_init()) };

    let mut len: c_int = 0;
    check("MPI_Get_count", unsafe {
        ffi::MPI_Get_count(&status, ffi::RSMPI_UINT8_T, &mut len)
    })?;
    let size = usize::try_from(len).map_err(|_| Error::Native {
        call: "MPI_Get_count",
        code: len,
    })?;
    let mut frame = vec![0u8; size];
    let mut status = MaybeUninit::<MPI_Status>::uninit();
    check("MPI_Mrecv", unsafe {
        ffi::MPI_Mrecv(
            frame.as_mut_ptr().cast(),
            len,
            ffi::RSMPI_UINT8_T,
            &mut message,
            status.as_mut_ptr(),
        )
    })?;
    Packet::decode(frame, source)
}

impl Transport for Native {
    fn send(&self, plane: Plane, destination: Rank, tag: Tag, packet: Packet) -> Result<()> {
        let frame = packet.encode();
        let len = frame_len(&frame)?;
        trace!(?plane, destination, tag, bytes = frame.len(), "send");
        check("MPI_Ssend", unsafe {
            ffi::MPI_Ssend(
                frame.as_ptr().cast(),
                len,
                ffi::RSMPI_UINT8_T,
                destination,
                tag,
                self.comms.get(plane),
            )
        })
    }

    fn receive(&self, plane: Plane, source: Rank, tag: Tag) -> Result<Packet> {
        let packet = receive_frame(self.comms.get(plane), source, tag)?;
        trace!(?plane, source, tag, count = packet.count, "receive");
        Ok(packet)
    }

    fn post_send(
        &self,
        plane: Plane,
        destination: Rank,
        tag: Tag,
        packet: Packet,
    ) -> Result<Box<dyn Transfer>> {
        let frame = packet.encode().into_boxed_slice();
        let len = frame_len(&frame)?;
        let mut request = MaybeUninit::<MPI_Request>::uninit();
        // SAFETY: the frame moves into the returned transfer, which keeps it
        // alive until the request has completed.
        check("MPI_Issend", unsafe {
            ffi::MPI_Issend(
                frame.as_ptr().cast(),
                len,
                ffi::RSMPI_UINT8_T,
                destination,
                tag,
                self.comms.get(plane),
                request.as_mut_ptr(),
            )
        })?;
        Ok(Box::new(PostedSend {
            request: unsafe { request.assume_init() },
            done: false,
            _frame: frame,
            _comms: Rc::clone(&self.comms),
        }))
    }

    fn post_receive(&self, plane: Plane, source: Rank, tag: Tag) -> Result<Box<dyn Transfer>> {
        Ok(Box::new(PostedReceive {
            comms: Rc::clone(&self.comms),
            plane,
            source,
            tag,
        }))
    }

    fn create_group(&self, ranks: &[Rank], tag: Tag) -> Result<Rc<dyn Transport>> {
        let parent = self.comms.point_to_point;
        let n = ranks
            .len()
            .value_as::<c_int>()
            .map_err(|_| Error::Oversized { len: ranks.len() })?;

        let mut group = MaybeUninit::<MPI_Group>::uninit();
        check("MPI_Comm_group", unsafe {
            ffi::MPI_Comm_group(parent, group.as_mut_ptr())
        })?;
        let mut group = unsafe { group.assume_init() };
        let mut subgroup = MaybeUninit::<MPI_Group>::uninit();
        let included = check("MPI_Group_incl", unsafe {
            ffi::MPI_Group_incl(group, n, ranks.as_ptr(), subgroup.as_mut_ptr())
        });
        unsafe { ffi::MPI_Group_free(&mut group) };
        included?;

        let mut subgroup = unsafe { subgroup.assume_init() };
        let mut newcomm = MaybeUninit::<MPI_Comm>::uninit();
        let created = check("MPI_Comm_create_group", unsafe {
            ffi::MPI_Comm_create_group(parent, subgroup, tag, newcomm.as_mut_ptr())
        });
        unsafe { ffi::MPI_Group_free(&mut subgroup) };
        created?;

        let point_to_point = unsafe { newcomm.assume_init() };
        let collective = duplicate(point_to_point).map_err(|err| {
            free(point_to_point);
            err
        })?;
        debug!(tag, size = ranks.len(), "created MPI communicator");
        Ok(Rc::new(Native {
            comms: Rc::new(Communicators {
                point_to_point,
                collective,
                library: Rc::clone(&self.comms.library),
            }),
        }))
    }

    fn abort(&self, code: i32) -> Error {
        error!(code, "aborting job");
        unsafe { ffi::MPI_Abort(ffi::RSMPI_COMM_WORLD, code) };
        process::abort()
    }

    fn abort_code(&self) -> Option<i32> {
        None
    }
}

struct PostedSend {
    request: MPI_Request,
    done: bool,
    _frame: Box<[u8]>,
    _comms: Rc<Communicators>,
}

impl PostedSend {
    fn complete(&mut self) -> Result<()> {
        let mut status = MaybeUninit::<MPI_Status>::uninit();
        let code = unsafe { ffi::MPI_Wait(&mut self.request, status.as_mut_ptr()) };
        self.done = true;
        check("MPI_Wait", code)
    }
}

impl Transfer for PostedSend {
    fn wait(mut self: Box<Self>) -> Result<Option<Packet>> {
        self.complete().map(|()| None)
    }

    fn is_complete(&self) -> bool {
        let mut flag: c_int = 0;
        let mut status = MaybeUninit::<MPI_Status>::uninit();
        let code = unsafe {
            ffi::MPI_Request_get_status(self.request, &mut flag, status.as_mut_ptr())
        };
        code == 0 && flag != 0
    }
}

impl Drop for PostedSend {
    fn drop(&mut self) {
        if !self.done {
            if let Err(err) = self.complete() {
                error!(%err, "posted send failed during drop");
            }
        }
    }
}

struct PostedReceive {
    comms: Rc<Communicators>,
    plane: Plane,
    source: Rank,
    tag: Tag,
}

impl Transfer for PostedReceive {
    fn wait(self: Box<Self>) -> Result<Option<Packet>> {
        receive_frame(self.comms.get(self.plane), self.source, self.tag).map(Some)
    }

    fn is_complete(&self) -> bool {
        let mut flag: c_int = 0;
        let mut status = MaybeUninit::<MPI_Status>::uninit();
        let code = unsafe {
            ffi::MPI_Iprobe(
                self.source,
                self.tag,
                self.comms.get(self.plane),
                &mut flag,
                status.as_mut_ptr(),
            )
        };
        code == 0 && flag != 0
    }
}
